use crate::SocketId;
use hashbrown::HashMap;
use indexmap::IndexSet;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

/// Application-level rejection of a registry operation. These are outcomes of
/// valid requests, not transport errors.
#[derive(Debug, Eq, PartialEq)]
pub enum RegistryError {
    DuplicateName,
    DuplicateSocket,
    UnknownUser,
    NotAMember,
}

/// A connected, identified participant. The connection handle is stored so
/// membership snapshots can be fanned out to without re-entering the
/// registry.
struct User<C> {
    username: String,
    ip: String,
    conn: C,
    rooms: IndexSet<String>,
}

/// A named broadcast group. The name is the key of the room map; a room
/// exists exactly as long as it has members.
struct Chatroom {
    members: IndexSet<SocketId>,
}

impl Chatroom {
    #[inline]
    fn new() -> Chatroom {
        Chatroom {
            members: IndexSet::new(),
        }
    }
}

/// One member of a room as seen by a snapshot.
#[derive(Debug, Clone)]
pub struct Member<C> {
    pub socket: SocketId,
    pub username: String,
    pub ip: String,
    pub conn: C,
}

/// Result of a successful room entry: the joiner's identity and the members
/// to notify (everyone already in the room).
#[derive(Debug)]
pub struct Joined<C> {
    pub username: String,
    pub ip: String,
    pub recipients: Vec<Member<C>>,
}

/// Result of a successful room exit: the leaver's identity and the members
/// remaining in the room after the exit.
#[derive(Debug)]
pub struct Left<C> {
    pub username: String,
    pub ip: String,
    pub remaining: Vec<Member<C>>,
}

/// Result of removing a user entirely: per formerly joined room, the members
/// remaining after the removal. Rooms that collapsed to zero members are
/// deleted and not listed.
pub struct Departure<C> {
    pub username: String,
    pub ip: String,
    pub rooms: Vec<(String, Vec<Member<C>>)>,
}

/// Authoritative store of live users and chatrooms.
///
/// Two locks guard the two collections. The ordering invariant is: the rooms
/// lock is acquired before the users lock, never the reverse. All dual-lock
/// operations go through `lock_both` so the ordering cannot drift. No lock is
/// held across I/O; mutating operations hand back the snapshots their callers
/// need for fan-out.
pub struct Registry<C> {
    rooms: Mutex<BTreeMap<String, Chatroom>>,
    users: Mutex<HashMap<SocketId, User<C>>>,
}

impl<C: Clone> Registry<C> {
    pub fn new() -> Registry<C> {
        Registry {
            rooms: Mutex::new(BTreeMap::new()),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Inserts a new user. Rejects an in-use username or socket id with no
    /// side-effect.
    pub fn add_user(
        &self,
        socket: SocketId,
        username: String,
        ip: String,
        conn: C,
    ) -> Result<(), RegistryError> {
        let mut users = self.lock_users();

        if users.contains_key(&socket) {
            return Err(RegistryError::DuplicateSocket);
        }

        if users.values().any(|user| user.username == username) {
            return Err(RegistryError::DuplicateName);
        }

        users.insert(
            socket,
            User {
                username,
                ip,
                conn,
                rooms: IndexSet::new(),
            },
        );

        Ok(())
    }

    /// Removes the user and their memberships. Rooms left without members are
    /// deleted. An absent user is a no-op.
    pub fn remove_user(&self, socket: SocketId) -> Option<Departure<C>> {
        let (mut rooms, mut users) = self.lock_both();

        let user = users.remove(&socket)?;
        let mut affected = Vec::with_capacity(user.rooms.len());

        for name in &user.rooms {
            let emptied = match rooms.get_mut(name) {
                Some(room) => {
                    room.members.swap_remove(&socket);
                    room.members.is_empty()
                }
                None => continue,
            };

            if emptied {
                rooms.remove(name);
            } else {
                affected.push((name.clone(), snapshot(&rooms[name].members, &users)));
            }
        }

        Some(Departure {
            username: user.username,
            ip: user.ip,
            rooms: affected,
        })
    }

    /// Atomically records the membership pairing, creating the room on first
    /// entry. Re-entering a joined room is a no-op with no recipients.
    pub fn enter_room(&self, socket: SocketId, room_name: &str) -> Result<Joined<C>, RegistryError> {
        let (mut rooms, mut users) = self.lock_both();

        let (username, ip) = {
            let user = users.get_mut(&socket).ok_or(RegistryError::UnknownUser)?;
            user.rooms.insert(room_name.to_string());
            (user.username.clone(), user.ip.clone())
        };

        let room = rooms
            .entry(room_name.to_string())
            .or_insert_with(Chatroom::new);

        let recipients = if room.members.insert(socket) {
            room.members
                .iter()
                .filter(|&&member| member != socket)
                .filter_map(|member| member_of(*member, &users))
                .collect()
        } else {
            Vec::new()
        };

        Ok(Joined {
            username,
            ip,
            recipients,
        })
    }

    /// Atomically removes the membership pairing; the room is deleted when
    /// its membership drops to zero.
    pub fn leave_room(&self, socket: SocketId, room_name: &str) -> Result<Left<C>, RegistryError> {
        let (mut rooms, mut users) = self.lock_both();

        let (username, ip) = {
            let user = users.get_mut(&socket).ok_or(RegistryError::UnknownUser)?;

            if !user.rooms.swap_remove(room_name) {
                return Err(RegistryError::NotAMember);
            }

            (user.username.clone(), user.ip.clone())
        };

        let emptied = {
            let room = rooms
                .get_mut(room_name)
                .expect("Membership recorded without a room entry");
            room.members.swap_remove(&socket);
            room.members.is_empty()
        };

        let remaining = if emptied {
            rooms.remove(room_name);
            Vec::new()
        } else {
            snapshot(&rooms[room_name].members, &users)
        };

        Ok(Left {
            username,
            ip,
            remaining,
        })
    }

    /// Point-in-time snapshot of the live room names, ascending by name.
    pub fn list_room_names(&self) -> Vec<String> {
        self.lock_rooms().keys().cloned().collect()
    }

    /// Point-in-time snapshot of `(username, ip)` pairs for the named room.
    pub fn list_room_members(&self, room_name: &str) -> Option<Vec<(String, String)>> {
        let (rooms, users) = self.lock_both();

        rooms.get(room_name).map(|room| {
            room.members
                .iter()
                .filter_map(|member| users.get(member))
                .map(|user| (user.username.clone(), user.ip.clone()))
                .collect()
        })
    }

    pub fn user_by_socket(&self, socket: SocketId) -> Option<(String, String)> {
        self.lock_users()
            .get(&socket)
            .map(|user| (user.username.clone(), user.ip.clone()))
    }

    /// Fan-out snapshot of the named room, connection handles included.
    pub fn room_members_snapshot(&self, room_name: &str) -> Option<Vec<Member<C>>> {
        let (rooms, users) = self.lock_both();

        rooms
            .get(room_name)
            .map(|room| snapshot(&room.members, &users))
    }

    /// Live user and room counts.
    pub fn stats(&self) -> (usize, usize) {
        let (rooms, users) = self.lock_both();
        (users.len(), rooms.len())
    }

    #[inline]
    fn lock_rooms(&self) -> MutexGuard<BTreeMap<String, Chatroom>> {
        self.rooms.lock().expect("Rooms lock poisoned")
    }

    #[inline]
    fn lock_users(&self) -> MutexGuard<HashMap<SocketId, User<C>>> {
        self.users.lock().expect("Users lock poisoned")
    }

    /// Sole acquisition point for operations touching both collections:
    /// rooms first, users second.
    #[inline]
    fn lock_both(
        &self,
    ) -> (
        MutexGuard<BTreeMap<String, Chatroom>>,
        MutexGuard<HashMap<SocketId, User<C>>>,
    ) {
        let rooms = self.lock_rooms();
        let users = self.lock_users();
        (rooms, users)
    }
}

fn member_of<C: Clone>(socket: SocketId, users: &HashMap<SocketId, User<C>>) -> Option<Member<C>> {
    users.get(&socket).map(|user| Member {
        socket,
        username: user.username.clone(),
        ip: user.ip.clone(),
        conn: user.conn.clone(),
    })
}

fn snapshot<C: Clone>(
    members: &IndexSet<SocketId>,
    users: &HashMap<SocketId, User<C>>,
) -> Vec<Member<C>> {
    members
        .iter()
        .filter_map(|&member| member_of(member, users))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry<()> {
        Registry::new()
    }

    fn seed(reg: &Registry<()>, socket: SocketId, name: &str) {
        reg.add_user(socket, name.to_string(), format!("10.0.0.{}", socket), ())
            .unwrap();
    }

    /// Checks the bidirectional consistency and no-empty-room invariants.
    fn assert_consistent(reg: &Registry<()>) {
        let (rooms, users) = reg.lock_both();

        for (name, room) in rooms.iter() {
            assert!(!room.members.is_empty(), "Room {} is empty but live", name);

            for member in &room.members {
                let user = users.get(member).expect("Member without user entry");
                assert!(user.rooms.contains(name));
            }
        }

        for (socket, user) in users.iter() {
            for name in &user.rooms {
                assert!(rooms[name].members.contains(socket));
            }
        }
    }

    #[test]
    fn test_add_user_err_duplicate_name() {
        let reg = registry();
        seed(&reg, 1, "alice");

        let result = reg.add_user(2, "alice".to_string(), "10.0.0.2".to_string(), ());

        assert_eq!(result.unwrap_err(), RegistryError::DuplicateName);
        assert_eq!(reg.stats(), (1, 0));
        assert!(reg.user_by_socket(2).is_none());
    }

    #[test]
    fn test_add_user_err_duplicate_socket() {
        let reg = registry();
        seed(&reg, 1, "alice");

        let result = reg.add_user(1, "bob".to_string(), "10.0.0.2".to_string(), ());

        assert_eq!(result.unwrap_err(), RegistryError::DuplicateSocket);
        assert_eq!(reg.user_by_socket(1).unwrap().0, "alice");
    }

    #[test]
    fn test_enter_room_creates_room() {
        let reg = registry();
        seed(&reg, 1, "alice");

        let joined = reg.enter_room(1, "lobby").unwrap();

        assert_eq!(joined.username, "alice");
        assert!(joined.recipients.is_empty());
        assert_eq!(reg.list_room_names(), vec!["lobby".to_string()]);
        assert_consistent(&reg);
    }

    #[test]
    fn test_enter_room_err_unknown_user() {
        let reg = registry();

        let result = reg.enter_room(9, "lobby");

        assert_eq!(result.unwrap_err(), RegistryError::UnknownUser);
        assert!(reg.list_room_names().is_empty());
    }

    #[test]
    fn test_enter_room_recipients_exclude_joiner() {
        let reg = registry();
        seed(&reg, 1, "alice");
        seed(&reg, 2, "bob");
        reg.enter_room(1, "lobby").unwrap();

        let joined = reg.enter_room(2, "lobby").unwrap();

        assert_eq!(joined.recipients.len(), 1);
        assert_eq!(joined.recipients[0].socket, 1);
        assert_eq!(joined.recipients[0].username, "alice");
        assert_consistent(&reg);
    }

    #[test]
    fn test_enter_room_twice_is_noop() {
        let reg = registry();
        seed(&reg, 1, "alice");
        seed(&reg, 2, "bob");
        reg.enter_room(1, "lobby").unwrap();
        reg.enter_room(2, "lobby").unwrap();

        let joined = reg.enter_room(2, "lobby").unwrap();

        assert!(joined.recipients.is_empty());
        assert_eq!(reg.room_members_snapshot("lobby").unwrap().len(), 2);
        assert_consistent(&reg);
    }

    #[test]
    fn test_join_leave_symmetry() {
        let reg = registry();
        seed(&reg, 1, "alice");

        reg.enter_room(1, "lobby").unwrap();
        let left = reg.leave_room(1, "lobby").unwrap();

        assert_eq!(left.username, "alice");
        assert!(left.remaining.is_empty());
        assert!(reg.list_room_names().is_empty());
        assert_consistent(&reg);
    }

    #[test]
    fn test_leave_room_is_idempotent() {
        let reg = registry();
        seed(&reg, 1, "alice");
        seed(&reg, 2, "bob");
        reg.enter_room(1, "lobby").unwrap();
        reg.enter_room(2, "lobby").unwrap();

        reg.leave_room(1, "lobby").unwrap();
        let names = reg.list_room_names();
        let members = reg.list_room_members("lobby");

        let result = reg.leave_room(1, "lobby");

        assert_eq!(result.unwrap_err(), RegistryError::NotAMember);
        assert_eq!(reg.list_room_names(), names);
        assert_eq!(reg.list_room_members("lobby"), members);
        assert_consistent(&reg);
    }

    #[test]
    fn test_leave_room_snapshots_remaining() {
        let reg = registry();
        seed(&reg, 1, "alice");
        seed(&reg, 2, "bob");
        reg.enter_room(1, "lobby").unwrap();
        reg.enter_room(2, "lobby").unwrap();

        let left = reg.leave_room(1, "lobby").unwrap();

        assert_eq!(left.remaining.len(), 1);
        assert_eq!(left.remaining[0].username, "bob");
        assert_consistent(&reg);
    }

    #[test]
    fn test_remove_user_collapses_empty_rooms() {
        let reg = registry();
        seed(&reg, 1, "alice");
        seed(&reg, 2, "bob");
        reg.enter_room(1, "lobby").unwrap();
        reg.enter_room(1, "den").unwrap();
        reg.enter_room(2, "lobby").unwrap();

        let departure = reg.remove_user(1).unwrap();

        assert_eq!(departure.username, "alice");
        // Only the room with members left is reported.
        assert_eq!(departure.rooms.len(), 1);
        assert_eq!(departure.rooms[0].0, "lobby");
        assert_eq!(departure.rooms[0].1.len(), 1);
        assert_eq!(departure.rooms[0].1[0].username, "bob");

        assert_eq!(reg.list_room_names(), vec!["lobby".to_string()]);
        assert_eq!(reg.stats(), (1, 1));
        assert_consistent(&reg);
    }

    #[test]
    fn test_remove_absent_user_is_noop() {
        let reg = registry();
        seed(&reg, 1, "alice");

        assert!(reg.remove_user(9).is_none());
        assert_eq!(reg.stats(), (1, 0));
    }

    #[test]
    fn test_list_room_names_sorted() {
        let reg = registry();
        seed(&reg, 1, "alice");
        reg.enter_room(1, "zebra").unwrap();
        reg.enter_room(1, "attic").unwrap();
        reg.enter_room(1, "lobby").unwrap();

        assert_eq!(
            reg.list_room_names(),
            vec!["attic".to_string(), "lobby".to_string(), "zebra".to_string()]
        );
    }

    #[test]
    fn test_list_room_members() {
        let reg = registry();
        seed(&reg, 1, "alice");
        seed(&reg, 2, "bob");
        reg.enter_room(1, "lobby").unwrap();
        reg.enter_room(2, "lobby").unwrap();

        let mut members = reg.list_room_members("lobby").unwrap();
        members.sort();

        assert_eq!(
            members,
            vec![
                ("alice".to_string(), "10.0.0.1".to_string()),
                ("bob".to_string(), "10.0.0.2".to_string())
            ]
        );

        assert!(reg.list_room_members("nowhere").is_none());
    }

    #[test]
    fn test_username_free_after_departure() {
        let reg = registry();
        seed(&reg, 1, "alice");

        reg.remove_user(1).unwrap();

        reg.add_user(2, "alice".to_string(), "10.0.0.2".to_string(), ())
            .unwrap();
        assert_eq!(reg.user_by_socket(2).unwrap().0, "alice");
    }
}
