//! In-memory key space
//!
//! A fixed number of logical databases, each a map from binary key to a typed
//! value with an optional absolute expiry. The replication pipeline only needs
//! three things from here: apply a command, take a point-in-time copy, and
//! replace everything with a loaded snapshot.

pub mod command;

pub use command::*;

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Default number of logical databases
pub const DEFAULT_DATABASES: usize = 16;

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// A typed value stored under a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(Bytes),
    List(VecDeque<Bytes>),
    Set(HashSet<Bytes>),
    Hash(HashMap<Bytes, Bytes>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Hash(_) => "hash",
        }
    }
}

/// A value plus its absolute expiry (Unix milliseconds)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub value: Value,
    pub expires_at_ms: Option<u64>,
}

impl Entry {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            expires_at_ms: None,
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at_ms, Some(at) if at <= now)
    }
}

/// One logical database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Database {
    entries: HashMap<Bytes, Entry>,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live entry
    pub fn get(&self, key: &[u8], now: u64) -> Option<&Entry> {
        self.entries.get(key).filter(|entry| !entry.is_expired(now))
    }

    /// Look up a live entry for modification, dropping it first if it expired
    pub fn get_mut(&mut self, key: &[u8], now: u64) -> Option<&mut Entry> {
        if self.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    pub fn insert(&mut self, key: Bytes, entry: Entry) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &[u8], now: u64) -> Option<Entry> {
        self.entries
            .remove(key)
            .filter(|entry| !entry.is_expired(now))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate live entries
    pub fn iter_live(&self, now: u64) -> impl Iterator<Item = (&Bytes, &Entry)> {
        self.entries
            .iter()
            .filter(move |(_, entry)| !entry.is_expired(now))
    }

    /// Count live keys and live keys carrying an expiry
    pub fn live_counts(&self, now: u64) -> (u64, u64) {
        self.iter_live(now).fold((0, 0), |(keys, ttls), (_, entry)| {
            (keys + 1, ttls + entry.expires_at_ms.is_some() as u64)
        })
    }

    pub fn len_live(&self, now: u64) -> usize {
        self.iter_live(now).count()
    }
}

/// Key space errors, rendered to clients as RESP error replies
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyspaceError {
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    #[error("ERR increment or decrement would overflow")]
    Overflow,

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpire(String),

    #[error("ERR DB index is out of range")]
    DbOutOfRange,
}

/// All logical databases behind one lock
#[derive(Debug)]
pub struct Keyspace {
    databases: RwLock<Vec<Database>>,
}

impl Keyspace {
    pub fn new(count: usize) -> Self {
        Self {
            databases: RwLock::new(vec![Database::new(); count.max(1)]),
        }
    }

    pub fn database_count(&self) -> usize {
        self.databases.read().len()
    }

    pub fn check_db(&self, db: usize) -> Result<(), KeyspaceError> {
        if db < self.database_count() {
            Ok(())
        } else {
            Err(KeyspaceError::DbOutOfRange)
        }
    }

    /// Execute a command against database `db`.
    ///
    /// Write commands take the write lock; read commands share the read lock.
    pub fn apply(&self, db: usize, args: &[Bytes]) -> Result<Applied, KeyspaceError> {
        let name = command_name(args)?;
        let now = now_ms();
        match command_kind(&name) {
            CommandKind::Write => {
                let mut databases = self.databases.write();
                execute_write(&mut databases, db, &name, args, now)
            }
            CommandKind::Read => {
                let databases = self.databases.read();
                let database = databases.get(db).ok_or(KeyspaceError::DbOutOfRange)?;
                execute_read(database, &name, args, now).map(Applied::reply_only)
            }
            CommandKind::Unknown => Err(KeyspaceError::UnknownCommand(name)),
        }
    }

    /// Point-in-time copy of every database
    pub fn clone_view(&self) -> Vec<Database> {
        self.databases.read().clone()
    }

    /// Replace every database with loaded content
    pub fn replace(&self, mut loaded: Vec<Database>) {
        let mut databases = self.databases.write();
        let count = databases.len();
        loaded.resize_with(count, Database::new);
        loaded.truncate(count);
        *databases = loaded;
    }

    /// Live key count of one database
    pub fn dbsize(&self, db: usize) -> usize {
        let now = now_ms();
        self.databases
            .read()
            .get(db)
            .map(|database| database.len_live(now))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let mut db = Database::new();
        db.insert(
            Bytes::from("gone"),
            Entry {
                value: Value::String(Bytes::from("x")),
                expires_at_ms: Some(1),
            },
        );
        db.insert(Bytes::from("kept"), Entry::new(Value::String(Bytes::from("y"))));

        let now = now_ms();
        assert!(db.get(b"gone", now).is_none());
        assert!(db.get(b"kept", now).is_some());
        assert_eq!(db.live_counts(now), (1, 0));
    }

    #[test]
    fn test_replace_keeps_database_count() {
        let keyspace = Keyspace::new(4);
        keyspace.apply(0, &args(&["SET", "a", "1"])).unwrap();

        let mut loaded = vec![Database::new()];
        loaded[0].insert(Bytes::from("b"), Entry::new(Value::String(Bytes::from("2"))));
        keyspace.replace(loaded);

        assert_eq!(keyspace.database_count(), 4);
        assert_eq!(keyspace.dbsize(0), 1);
        let reply = keyspace.apply(0, &args(&["GET", "a"])).unwrap().reply;
        assert_eq!(reply, crate::resp::Frame::Null);
    }

    #[test]
    fn test_db_out_of_range() {
        let keyspace = Keyspace::new(2);
        assert_eq!(
            keyspace.apply(5, &args(&["GET", "a"])).unwrap_err(),
            KeyspaceError::DbOutOfRange
        );
        assert!(keyspace.check_db(1).is_ok());
    }
}
