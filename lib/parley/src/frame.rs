use crate::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Leading constant of every frame header, in network byte order on the wire.
pub const FRAME_MARKER: u16 = 0xFFEF;

/// Marker + type + payload size, packed with no padding.
pub const HEADER_SIZE: usize = 8;

/// Upper bound on the declared payload size of an incoming frame. Anything
/// larger is rejected before the body is read.
pub const MAX_PAYLOAD_SIZE: usize = 1 << 20;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageType {
    NoMessage = 0x0000,
    UserEnter = 0x0001,
    UserLeave = 0x0002,
    ChatroomList = 0x0003,
    UserList = 0x0004,
    EnterChatroom = 0x0005,
    LeaveChatroom = 0x0006,
    SendChatroomMessage = 0x0007,
    ServerChatroomMessage = 0x0008,
    SendUserMessage = 0x0009,
    NotifyError = 0x000A,
    NotifyUserJoined = 0x000B,
    NotifyUserLeft = 0x000C,
}

impl MessageType {
    /// Maps a wire code back to a known message type. Unknown codes yield
    /// `None` and are left to the session to ignore.
    #[inline]
    pub fn from_code(code: u16) -> Option<MessageType> {
        Some(match code {
            0x0000 => MessageType::NoMessage,
            0x0001 => MessageType::UserEnter,
            0x0002 => MessageType::UserLeave,
            0x0003 => MessageType::ChatroomList,
            0x0004 => MessageType::UserList,
            0x0005 => MessageType::EnterChatroom,
            0x0006 => MessageType::LeaveChatroom,
            0x0007 => MessageType::SendChatroomMessage,
            0x0008 => MessageType::ServerChatroomMessage,
            0x0009 => MessageType::SendUserMessage,
            0x000A => MessageType::NotifyError,
            0x000B => MessageType::NotifyUserJoined,
            0x000C => MessageType::NotifyUserLeft,
            _ => return None,
        })
    }
}

impl From<MessageType> for u16 {
    #[inline]
    fn from(message_type: MessageType) -> Self {
        message_type as u16
    }
}

/// A decoded frame. The payload is opaque at this layer; interpretation
/// depends on the type code.
#[derive(Debug, Eq, PartialEq)]
pub struct Message {
    pub type_code: u16,
    pub payload: Vec<u8>,
}

impl Message {
    #[inline]
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Message {
        Message {
            type_code: message_type.into(),
            payload,
        }
    }

    #[inline]
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_code(self.type_code)
    }
}

/// Writes a full frame to the connection. Partial writes are retried until
/// everything is flushed or a non-retryable error occurs.
pub fn send_message<W: Write>(conn: &mut W, type_code: u16, payload: &[u8]) -> NetworkResult<()> {
    debug_assert!(payload.len() <= u32::max_value() as usize);

    let mut header = [0u8; HEADER_SIZE];
    {
        let mut stream = &mut header[..];
        stream.write_u16::<BigEndian>(FRAME_MARKER)?;
        stream.write_u16::<BigEndian>(type_code)?;
        stream.write_u32::<BigEndian>(payload.len() as u32)?;
    }

    write_full(conn, &header)?;
    write_full(conn, payload)
}

/// Reads one full frame off the connection.
///
/// A transient error before the first header byte yields `Wait` and the call
/// can be retried cleanly. Once the frame has been entered, short reads are
/// looped; EOF mid-frame and a marker mismatch are fatal and the session must
/// drop the connection.
pub fn receive_message<R: Read>(conn: &mut R) -> NetworkResult<Message> {
    let mut header = [0u8; HEADER_SIZE];
    read_full(conn, &mut header, true)?;

    let mut stream = &header[..];
    let marker = stream.read_u16::<BigEndian>()?;
    let type_code = stream.read_u16::<BigEndian>()?;
    let size = stream.read_u32::<BigEndian>()? as usize;

    if marker != FRAME_MARKER {
        return Err(NetworkError::Fatal(ErrorType::BadMarker));
    }

    if size > MAX_PAYLOAD_SIZE {
        return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
    }

    let mut payload = vec![0u8; size];
    read_full(conn, &mut payload, false)?;

    Ok(Message { type_code, payload })
}

fn write_full<W: Write>(conn: &mut W, mut buf: &[u8]) -> NetworkResult<()> {
    while !buf.is_empty() {
        match conn.write(buf) {
            Ok(0) => return Err(NetworkError::Fatal(ErrorType::Closed)),
            Ok(count) => buf = &buf[count..],
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}

/// Fills the buffer completely. With `clean_start` a transient error before
/// any byte has been consumed is surfaced as `Wait`; mid-frame the read is
/// simply retried since the stream position is no longer a frame boundary.
fn read_full<R: Read>(conn: &mut R, buf: &mut [u8], clean_start: bool) -> NetworkResult<()> {
    let mut filled = 0;

    while filled < buf.len() {
        match conn.read(&mut buf[filled..]) {
            Ok(0) => return Err(NetworkError::Fatal(ErrorType::Closed)),
            Ok(count) => filled += count,
            Err(err) => match err.kind() {
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    if filled > 0 || !clean_start =>
                {
                    continue;
                }
                _ => return Err(err.into()),
            },
        }
    }

    Ok(())
}

/// Bytes of the first NUL-terminated field. A payload without a terminator is
/// taken whole.
#[inline]
pub fn text_field(payload: &[u8]) -> &[u8] {
    match payload.iter().position(|&byte| byte == 0) {
        Some(end) => &payload[..end],
        None => payload,
    }
}

/// Splits a `first\0second\0` payload into its two fields.
#[inline]
pub fn split_pair(payload: &[u8]) -> (&[u8], &[u8]) {
    match payload.iter().position(|&byte| byte == 0) {
        Some(end) => (&payload[..end], text_field(&payload[end + 1..])),
        None => (payload, &[]),
    }
}

/// Joins entries with `\n` and replaces the trailing separator with a NUL
/// terminator. An empty sequence yields an empty payload.
pub fn join_lines<I: IntoIterator<Item = String>>(entries: I) -> Vec<u8> {
    let mut payload = Vec::new();

    for entry in entries {
        payload.extend_from_slice(entry.as_bytes());
        payload.push(b'\n');
    }

    if let Some(last) = payload.last_mut() {
        *last = 0;
    }

    payload
}

/// Payload of a join/leave notification: `room\nusername@ip\0`.
#[inline]
pub fn member_notice(room: &str, username: &str, ip: &str) -> Vec<u8> {
    format!("{}\n{}@{}\0", room, username, ip).into_bytes()
}

/// Payload of a relayed chatroom message: `sender\0room\0text\0`.
pub fn chat_broadcast(sender: &str, room: &str, text: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(sender.len() + room.len() + text.len() + 3);
    payload.extend_from_slice(sender.as_bytes());
    payload.push(0);
    payload.extend_from_slice(room.as_bytes());
    payload.push(0);
    payload.extend_from_slice(text);
    payload.push(0);
    payload
}
