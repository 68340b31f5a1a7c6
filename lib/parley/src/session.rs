use crate::frame::{self, Message, MessageType};
use crate::logging;
use crate::registry::{Member, Registry, RegistryError};
use crate::support::{ErrorUtils, NetworkError};
use crate::SocketId;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

/// Shared handle to a live connection. The owning session reads from it;
/// fan-out writes go through clones held by the registry.
pub type Conn = Arc<TcpStream>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SessionState {
    /// Connected but unidentified; only a user entry is acceptable.
    AwaitingEnter,
    /// Identified; the full message vocabulary is available.
    Active,
    /// Terminal; the connection is being torn down.
    Closing,
}

/// Drives one client from connect to disconnect. All I/O on the session's
/// own stream is blocking; the registry is the only shared state touched.
pub struct Session {
    socket_id: SocketId,
    stream: Conn,
    ip: String,
    registry: Arc<Registry<Conn>>,
    state: SessionState,
    log: logging::Logger,
}

impl Session {
    pub fn new(
        socket_id: SocketId,
        stream: Conn,
        ip: String,
        registry: Arc<Registry<Conn>>,
        log: &logging::Logger,
    ) -> Session {
        Session {
            socket_id,
            stream,
            ip,
            registry,
            state: SessionState::AwaitingEnter,
            log: log.new(logging::o!("socket_id" => socket_id)),
        }
    }

    /// Receive/dispatch loop. Returns once the session has reached the
    /// closing state and the user has been withdrawn from the registry.
    pub fn run(mut self) {
        logging::debug!(self.log, "session started"; "ip" => &self.ip);

        while self.state != SessionState::Closing {
            match frame::receive_message(&mut &*self.stream) {
                Ok(message) => self.dispatch(&message),
                Err(NetworkError::Wait) => continue,
                Err(NetworkError::Fatal(err)) => {
                    logging::debug!(self.log, "receive failed"; "error" => ?err);
                    self.state = SessionState::Closing;
                }
            }
        }

        self.depart();
    }

    fn dispatch(&mut self, message: &Message) {
        logging::trace!(self.log, "handling message";
                        "type_code" => message.type_code,
                        "size" => message.payload.len());

        match self.state {
            SessionState::AwaitingEnter => self.handle_awaiting_enter(message),
            SessionState::Active => self.handle_active(message),
            SessionState::Closing => unreachable!("Dispatch on a closing session"),
        }
    }

    /// Before identification only `USER_ENTER` is acceptable; everything
    /// else is a protocol violation answered by dropping the connection.
    fn handle_awaiting_enter(&mut self, message: &Message) {
        if message.message_type() != Some(MessageType::UserEnter) {
            logging::info!(self.log, "message before user entry, disconnecting";
                           "type_code" => message.type_code);
            self.state = SessionState::Closing;
            return;
        }

        let username = String::from_utf8_lossy(frame::text_field(&message.payload)).into_owned();

        if username.is_empty() {
            logging::info!(self.log, "user entry without a username, disconnecting");
            self.state = SessionState::Closing;
            return;
        }

        let admitted = self.registry.add_user(
            self.socket_id,
            username.clone(),
            self.ip.clone(),
            self.stream.clone(),
        );

        match admitted {
            Ok(()) => {
                logging::info!(self.log, "user entered"; "username" => &username, "ip" => &self.ip);
                self.log_stats();
                self.state = SessionState::Active;
            }
            Err(reject) => {
                // No error frame is defined for this case; the client is
                // simply disconnected.
                logging::info!(self.log, "user entry rejected, disconnecting";
                               "username" => &username,
                               "reason" => ?reject);
                self.state = SessionState::Closing;
            }
        }
    }

    fn handle_active(&mut self, message: &Message) {
        match message.message_type() {
            Some(MessageType::UserEnter) => {
                logging::info!(self.log, "repeated user entry, disconnecting");
                self.state = SessionState::Closing;
            }
            Some(MessageType::UserLeave) => {
                self.state = SessionState::Closing;
            }
            Some(MessageType::ChatroomList) => self.handle_chatroom_list(),
            Some(MessageType::UserList) => self.handle_user_list(&message.payload),
            Some(MessageType::EnterChatroom) => self.handle_enter_chatroom(&message.payload),
            Some(MessageType::LeaveChatroom) => self.handle_leave_chatroom(&message.payload),
            Some(MessageType::SendChatroomMessage) => {
                self.handle_send_chatroom_message(&message.payload)
            }
            _ => {
                // Unknown and server-to-client codes are ignored to stay
                // compatible with newer clients.
                logging::info!(self.log, "ignoring message";
                               "type_code" => message.type_code);
            }
        }
    }

    fn handle_chatroom_list(&mut self) {
        let payload = frame::join_lines(self.registry.list_room_names());
        self.reply(MessageType::ChatroomList, &payload);
    }

    fn handle_user_list(&mut self, payload: &[u8]) {
        let room = String::from_utf8_lossy(frame::text_field(payload)).into_owned();

        let listing = match self.registry.list_room_members(&room) {
            Some(members) => frame::join_lines(
                members
                    .into_iter()
                    .map(|(username, ip)| format!("{}@{}", username, ip)),
            ),
            // Unknown room: empty listing.
            None => Vec::new(),
        };

        self.reply(MessageType::UserList, &listing);
    }

    fn handle_enter_chatroom(&mut self, payload: &[u8]) {
        let room = String::from_utf8_lossy(frame::text_field(payload)).into_owned();

        if room.is_empty() {
            logging::info!(self.log, "room entry without a room name ignored");
            return;
        }

        match self.registry.enter_room(self.socket_id, &room) {
            Ok(joined) => {
                logging::info!(self.log, "user joined room";
                               "username" => &joined.username,
                               "room" => &room);
                self.log_stats();

                let notice = frame::member_notice(&room, &joined.username, &joined.ip);
                self.fan_out(&joined.recipients, MessageType::NotifyUserJoined, &notice);
            }
            Err(err) => {
                logging::error!(self.log, "room entry failed, disconnecting"; "error" => ?err);
                self.state = SessionState::Closing;
            }
        }
    }

    fn handle_leave_chatroom(&mut self, payload: &[u8]) {
        let room = String::from_utf8_lossy(frame::text_field(payload)).into_owned();

        if room.is_empty() {
            logging::info!(self.log, "room exit without a room name ignored");
            return;
        }

        match self.registry.leave_room(self.socket_id, &room) {
            Ok(left) => {
                logging::info!(self.log, "user left room";
                               "username" => &left.username,
                               "room" => &room);
                self.log_stats();

                let notice = frame::member_notice(&room, &left.username, &left.ip);
                self.fan_out(&left.remaining, MessageType::NotifyUserLeft, &notice);
            }
            Err(RegistryError::NotAMember) => {
                // Client-side confusion, forgiven.
                logging::debug!(self.log, "exit from a room the user is not in"; "room" => &room);
            }
            Err(err) => {
                logging::error!(self.log, "room exit failed, disconnecting"; "error" => ?err);
                self.state = SessionState::Closing;
            }
        }
    }

    fn handle_send_chatroom_message(&mut self, payload: &[u8]) {
        let (room_raw, text) = frame::split_pair(payload);
        let room = String::from_utf8_lossy(room_raw).into_owned();

        let (sender, _) = match self.registry.user_by_socket(self.socket_id) {
            Some(identity) => identity,
            None => {
                logging::error!(self.log, "active session without a user, disconnecting");
                self.state = SessionState::Closing;
                return;
            }
        };

        // The sender is included in the snapshot and receives its own echo.
        let members = match self.registry.room_members_snapshot(&room) {
            Some(members) => members,
            None => {
                logging::debug!(self.log, "message to an unknown room"; "room" => &room);
                return;
            }
        };

        let relay = frame::chat_broadcast(&sender, &room, text);
        self.fan_out(&members, MessageType::SendChatroomMessage, &relay);
    }

    /// Sends one payload to every member of a snapshot. A recipient that
    /// errors is shut down and skipped; its own session observes the failure
    /// on its next receive.
    fn fan_out(&self, members: &[Member<Conn>], message_type: MessageType, payload: &[u8]) {
        for member in members {
            let result = frame::send_message(&mut &*member.conn, message_type.into(), payload);

            if result.has_failed() {
                logging::info!(self.log, "dropping unreachable recipient";
                               "recipient" => member.socket);
                let _ = member.conn.shutdown(Shutdown::Both);
            }
        }
    }

    /// Sends a reply on the session's own stream; a fatal send error closes
    /// the session.
    fn reply(&mut self, message_type: MessageType, payload: &[u8]) {
        let result = frame::send_message(&mut &*self.stream, message_type.into(), payload);

        if result.has_failed() {
            logging::debug!(self.log, "reply failed"; "type" => ?message_type);
            self.state = SessionState::Closing;
        }
    }

    /// Withdraws the user, notifies the rooms they were in and tears the
    /// connection down.
    fn depart(&mut self) {
        if let Some(departure) = self.registry.remove_user(self.socket_id) {
            logging::info!(self.log, "user left"; "username" => &departure.username);

            for (room, remaining) in &departure.rooms {
                let notice = frame::member_notice(room, &departure.username, &departure.ip);
                self.fan_out(remaining, MessageType::NotifyUserLeft, &notice);
            }

            self.log_stats();
        }

        let _ = self.stream.shutdown(Shutdown::Both);
        logging::debug!(self.log, "session closed");
    }

    fn log_stats(&self) {
        let (users, rooms) = self.registry.stats();
        logging::info!(self.log, "registry stats"; "users" => users, "rooms" => rooms);
    }
}
