//! Command execution against the key space
//!
//! Every write command reports the exact argument vector that must be
//! propagated to the WAL and to replicas. Relative expirations are rewritten
//! to absolute ones so a replayed or replicated command lands on the same
//! deadline no matter how late it is applied.

use super::{Database, Entry, KeyspaceError, Value};
use crate::resp::Frame;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};

/// Read/write classification of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Read,
    Write,
    Unknown,
}

/// Outcome of a successfully executed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// Reply for the client
    pub reply: Frame,
    /// Arguments to propagate, present only when the command changed the data set
    pub propagate: Option<Vec<Bytes>>,
}

impl Applied {
    pub fn reply_only(reply: Frame) -> Self {
        Self {
            reply,
            propagate: None,
        }
    }

    fn propagated(reply: Frame, args: Vec<Bytes>) -> Self {
        Self {
            reply,
            propagate: Some(args),
        }
    }
}

/// Upper-cased command name of an argument vector
pub fn command_name(args: &[Bytes]) -> Result<String, KeyspaceError> {
    args.first()
        .map(|name| String::from_utf8_lossy(name).to_ascii_uppercase())
        .ok_or_else(|| KeyspaceError::UnknownCommand(String::new()))
}

pub fn command_kind(name: &str) -> CommandKind {
    match name {
        "SET" | "DEL" | "INCR" | "INCRBY" | "DECR" | "APPEND" | "LPUSH" | "RPUSH" | "LPOP"
        | "SADD" | "HSET" | "EXPIRE" | "PEXPIRE" | "PEXPIREAT" | "PERSIST" | "FLUSHDB"
        | "FLUSHALL" => CommandKind::Write,
        "GET" | "EXISTS" | "LRANGE" | "SMEMBERS" | "HGET" | "HGETALL" | "TTL" | "PTTL"
        | "DBSIZE" | "KEYS" | "TYPE" => CommandKind::Read,
        _ => CommandKind::Unknown,
    }
}

pub fn is_write_command(args: &[Bytes]) -> bool {
    command_name(args).is_ok_and(|name| command_kind(&name) == CommandKind::Write)
}

fn arity(name: &str, args: &[Bytes], min: usize, exact: bool) -> Result<(), KeyspaceError> {
    let ok = if exact {
        args.len() == min
    } else {
        args.len() >= min
    };
    if ok {
        Ok(())
    } else {
        Err(KeyspaceError::WrongArity(name.to_ascii_lowercase()))
    }
}

fn parse_i64(arg: &[u8]) -> Result<i64, KeyspaceError> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(KeyspaceError::NotInteger)
}

fn int_bytes(n: i64) -> Bytes {
    Bytes::from(n.to_string())
}

pub(super) fn execute_write(
    databases: &mut [Database],
    db: usize,
    name: &str,
    args: &[Bytes],
    now: u64,
) -> Result<Applied, KeyspaceError> {
    if name == "FLUSHALL" {
        arity(name, args, 1, true)?;
        databases.iter_mut().for_each(Database::clear);
        return Ok(Applied::propagated(Frame::ok(), args.to_vec()));
    }

    let database = databases.get_mut(db).ok_or(KeyspaceError::DbOutOfRange)?;

    match name {
        "SET" => set(database, args, now),
        "DEL" => {
            arity(name, args, 2, false)?;
            let mut removed = Vec::new();
            for key in &args[1..] {
                if database.remove(key, now).is_some() {
                    removed.push(key.clone());
                }
            }
            let count = removed.len() as i64;
            if removed.is_empty() {
                return Ok(Applied::reply_only(Frame::Integer(0)));
            }
            let mut propagate = vec![args[0].clone()];
            propagate.extend(removed);
            Ok(Applied::propagated(Frame::Integer(count), propagate))
        }
        "INCR" | "DECR" => {
            arity(name, args, 2, true)?;
            let delta = if name == "INCR" { 1 } else { -1 };
            incr_by(database, &args[1], delta, now).map(|n| Applied::propagated(Frame::Integer(n), args.to_vec()))
        }
        "INCRBY" => {
            arity(name, args, 3, true)?;
            let delta = parse_i64(&args[2])?;
            incr_by(database, &args[1], delta, now).map(|n| Applied::propagated(Frame::Integer(n), args.to_vec()))
        }
        "APPEND" => {
            arity(name, args, 3, true)?;
            let len = match database.get_mut(&args[1], now) {
                Some(Entry { value: Value::String(current), .. }) => {
                    let mut joined = Vec::with_capacity(current.len() + args[2].len());
                    joined.extend_from_slice(current);
                    joined.extend_from_slice(&args[2]);
                    *current = Bytes::from(joined);
                    current.len()
                }
                Some(_) => return Err(KeyspaceError::WrongType),
                None => {
                    database.insert(args[1].clone(), Entry::new(Value::String(args[2].clone())));
                    args[2].len()
                }
            };
            Ok(Applied::propagated(Frame::Integer(len as i64), args.to_vec()))
        }
        "LPUSH" | "RPUSH" => {
            arity(name, args, 3, false)?;
            if database.get(&args[1], now).is_none() {
                database.insert(args[1].clone(), Entry::new(Value::List(VecDeque::new())));
            }
            let Some(Entry { value: Value::List(list), .. }) = database.get_mut(&args[1], now) else {
                return Err(KeyspaceError::WrongType);
            };
            for item in &args[2..] {
                if name == "LPUSH" {
                    list.push_front(item.clone());
                } else {
                    list.push_back(item.clone());
                }
            }
            let len = list.len() as i64;
            Ok(Applied::propagated(Frame::Integer(len), args.to_vec()))
        }
        "LPOP" => {
            arity(name, args, 2, true)?;
            let (popped, now_empty) = match database.get_mut(&args[1], now) {
                Some(Entry { value: Value::List(list), .. }) => {
                    let popped = list.pop_front();
                    (popped, list.is_empty())
                }
                Some(_) => return Err(KeyspaceError::WrongType),
                None => return Ok(Applied::reply_only(Frame::Null)),
            };
            if now_empty {
                database.remove(&args[1], now);
            }
            match popped {
                Some(item) => Ok(Applied::propagated(Frame::Bulk(item), args.to_vec())),
                None => Ok(Applied::reply_only(Frame::Null)),
            }
        }
        "SADD" => {
            arity(name, args, 3, false)?;
            if database.get(&args[1], now).is_none() {
                database.insert(args[1].clone(), Entry::new(Value::Set(HashSet::new())));
            }
            let Some(Entry { value: Value::Set(set), .. }) = database.get_mut(&args[1], now) else {
                return Err(KeyspaceError::WrongType);
            };
            let added = args[2..].iter().filter(|m| set.insert((*m).clone())).count() as i64;
            if added == 0 {
                return Ok(Applied::reply_only(Frame::Integer(0)));
            }
            Ok(Applied::propagated(Frame::Integer(added), args.to_vec()))
        }
        "HSET" => {
            if args.len() < 4 || args.len() % 2 != 0 {
                return Err(KeyspaceError::WrongArity("hset".to_string()));
            }
            if database.get(&args[1], now).is_none() {
                database.insert(args[1].clone(), Entry::new(Value::Hash(HashMap::new())));
            }
            let Some(Entry { value: Value::Hash(hash), .. }) = database.get_mut(&args[1], now) else {
                return Err(KeyspaceError::WrongType);
            };
            let added = args[2..]
                .chunks(2)
                .filter(|pair| hash.insert(pair[0].clone(), pair[1].clone()).is_none())
                .count() as i64;
            Ok(Applied::propagated(Frame::Integer(added), args.to_vec()))
        }
        "EXPIRE" | "PEXPIRE" | "PEXPIREAT" => {
            arity(name, args, 3, true)?;
            let amount = parse_i64(&args[2])?;
            let deadline = match name {
                "EXPIRE" => amount
                    .checked_mul(1000)
                    .and_then(|ms| ms.checked_add(now as i64)),
                "PEXPIRE" => amount.checked_add(now as i64),
                _ => Some(amount),
            }
            .ok_or_else(|| KeyspaceError::InvalidExpire(name.to_ascii_lowercase()))?;
            expire_at(database, &args[1], deadline, now)
        }
        "PERSIST" => {
            arity(name, args, 2, true)?;
            match database.get_mut(&args[1], now) {
                Some(entry) if entry.expires_at_ms.is_some() => {
                    entry.expires_at_ms = None;
                    Ok(Applied::propagated(Frame::Integer(1), args.to_vec()))
                }
                _ => Ok(Applied::reply_only(Frame::Integer(0))),
            }
        }
        "FLUSHDB" => {
            arity(name, args, 1, true)?;
            database.clear();
            Ok(Applied::propagated(Frame::ok(), args.to_vec()))
        }
        other => Err(KeyspaceError::UnknownCommand(other.to_ascii_lowercase())),
    }
}

fn set(database: &mut Database, args: &[Bytes], now: u64) -> Result<Applied, KeyspaceError> {
    arity("SET", args, 3, false)?;

    let mut expires_at_ms: Option<u64> = None;
    let mut only_if_absent = false;
    let mut only_if_present = false;
    let mut options = args[3..].iter();
    while let Some(option) = options.next() {
        let option = String::from_utf8_lossy(option).to_ascii_uppercase();
        match option.as_str() {
            "NX" => only_if_absent = true,
            "XX" => only_if_present = true,
            "EX" | "PX" | "PXAT" => {
                let amount = parse_i64(options.next().ok_or(KeyspaceError::Syntax)?)?;
                if amount <= 0 {
                    return Err(KeyspaceError::InvalidExpire("set".to_string()));
                }
                let deadline = match option.as_str() {
                    "EX" => amount.checked_mul(1000).and_then(|ms| ms.checked_add(now as i64)),
                    "PX" => amount.checked_add(now as i64),
                    _ => Some(amount),
                }
                .ok_or_else(|| KeyspaceError::InvalidExpire("set".to_string()))?;
                expires_at_ms = Some(deadline as u64);
            }
            _ => return Err(KeyspaceError::Syntax),
        }
    }
    if only_if_absent && only_if_present {
        return Err(KeyspaceError::Syntax);
    }

    let exists = database.get(&args[1], now).is_some();
    if (only_if_absent && exists) || (only_if_present && !exists) {
        return Ok(Applied::reply_only(Frame::Null));
    }

    database.insert(
        args[1].clone(),
        Entry {
            value: Value::String(args[2].clone()),
            expires_at_ms,
        },
    );

    let mut propagate = vec![Bytes::from_static(b"SET"), args[1].clone(), args[2].clone()];
    if let Some(at) = expires_at_ms {
        propagate.push(Bytes::from_static(b"PXAT"));
        propagate.push(Bytes::from(at.to_string()));
    }
    Ok(Applied::propagated(Frame::ok(), propagate))
}

fn incr_by(database: &mut Database, key: &Bytes, delta: i64, now: u64) -> Result<i64, KeyspaceError> {
    match database.get_mut(key, now) {
        Some(Entry { value: Value::String(current), .. }) => {
            let value = parse_i64(current)?;
            let next = value.checked_add(delta).ok_or(KeyspaceError::Overflow)?;
            *current = int_bytes(next);
            Ok(next)
        }
        Some(_) => Err(KeyspaceError::WrongType),
        None => {
            database.insert(key.clone(), Entry::new(Value::String(int_bytes(delta))));
            Ok(delta)
        }
    }
}

fn expire_at(database: &mut Database, key: &Bytes, deadline: i64, now: u64) -> Result<Applied, KeyspaceError> {
    if database.get(key, now).is_none() {
        return Ok(Applied::reply_only(Frame::Integer(0)));
    }

    if deadline <= now as i64 {
        database.remove(key, now);
        return Ok(Applied::propagated(
            Frame::Integer(1),
            vec![Bytes::from_static(b"DEL"), key.clone()],
        ));
    }

    if let Some(entry) = database.get_mut(key, now) {
        entry.expires_at_ms = Some(deadline as u64);
    }
    Ok(Applied::propagated(
        Frame::Integer(1),
        vec![
            Bytes::from_static(b"PEXPIREAT"),
            key.clone(),
            Bytes::from(deadline.to_string()),
        ],
    ))
}

pub(super) fn execute_read(
    database: &Database,
    name: &str,
    args: &[Bytes],
    now: u64,
) -> Result<Frame, KeyspaceError> {
    match name {
        "GET" => {
            arity(name, args, 2, true)?;
            match database.get(&args[1], now) {
                Some(Entry { value: Value::String(data), .. }) => Ok(Frame::Bulk(data.clone())),
                Some(_) => Err(KeyspaceError::WrongType),
                None => Ok(Frame::Null),
            }
        }
        "EXISTS" => {
            arity(name, args, 2, false)?;
            let count = args[1..]
                .iter()
                .filter(|key| database.get(key, now).is_some())
                .count();
            Ok(Frame::Integer(count as i64))
        }
        "TYPE" => {
            arity(name, args, 2, true)?;
            let type_name = database
                .get(&args[1], now)
                .map(|entry| entry.value.type_name())
                .unwrap_or("none");
            Ok(Frame::Simple(type_name.to_string()))
        }
        "LRANGE" => {
            arity(name, args, 4, true)?;
            let list = match database.get(&args[1], now) {
                Some(Entry { value: Value::List(list), .. }) => list,
                Some(_) => return Err(KeyspaceError::WrongType),
                None => return Ok(Frame::Array(Vec::new())),
            };
            let len = list.len() as i64;
            let normalize = |index: i64| if index < 0 { (len + index).max(0) } else { index };
            let start = normalize(parse_i64(&args[2])?);
            let stop = normalize(parse_i64(&args[3])?).min(len - 1);
            if start > stop || start >= len {
                return Ok(Frame::Array(Vec::new()));
            }
            Ok(Frame::Array(
                list.iter()
                    .skip(start as usize)
                    .take((stop - start + 1) as usize)
                    .map(|item| Frame::Bulk(item.clone()))
                    .collect(),
            ))
        }
        "SMEMBERS" => {
            arity(name, args, 2, true)?;
            match database.get(&args[1], now) {
                Some(Entry { value: Value::Set(set), .. }) => {
                    let mut members: Vec<_> = set.iter().cloned().collect();
                    members.sort();
                    Ok(Frame::Array(members.into_iter().map(Frame::Bulk).collect()))
                }
                Some(_) => Err(KeyspaceError::WrongType),
                None => Ok(Frame::Array(Vec::new())),
            }
        }
        "HGET" => {
            arity(name, args, 3, true)?;
            match database.get(&args[1], now) {
                Some(Entry { value: Value::Hash(hash), .. }) => {
                    Ok(hash.get(&args[2]).cloned().map(Frame::Bulk).unwrap_or(Frame::Null))
                }
                Some(_) => Err(KeyspaceError::WrongType),
                None => Ok(Frame::Null),
            }
        }
        "HGETALL" => {
            arity(name, args, 2, true)?;
            match database.get(&args[1], now) {
                Some(Entry { value: Value::Hash(hash), .. }) => {
                    let mut pairs: Vec<_> = hash.iter().collect();
                    pairs.sort();
                    Ok(Frame::Array(
                        pairs
                            .into_iter()
                            .flat_map(|(f, v)| [Frame::Bulk(f.clone()), Frame::Bulk(v.clone())])
                            .collect(),
                    ))
                }
                Some(_) => Err(KeyspaceError::WrongType),
                None => Ok(Frame::Array(Vec::new())),
            }
        }
        "TTL" | "PTTL" => {
            arity(name, args, 2, true)?;
            let remaining = match database.get(&args[1], now) {
                None => -2,
                Some(Entry { expires_at_ms: None, .. }) => -1,
                Some(Entry { expires_at_ms: Some(at), .. }) => {
                    let ms = at.saturating_sub(now) as i64;
                    if name == "TTL" {
                        (ms + 500) / 1000
                    } else {
                        ms
                    }
                }
            };
            Ok(Frame::Integer(remaining))
        }
        "DBSIZE" => {
            arity(name, args, 1, true)?;
            Ok(Frame::Integer(database.len_live(now) as i64))
        }
        "KEYS" => {
            arity(name, args, 2, true)?;
            if &args[1][..] != b"*" {
                return Err(KeyspaceError::Syntax);
            }
            let mut keys: Vec<_> = database.iter_live(now).map(|(key, _)| key.clone()).collect();
            keys.sort();
            Ok(Frame::Array(keys.into_iter().map(Frame::Bulk).collect()))
        }
        other => Err(KeyspaceError::UnknownCommand(other.to_ascii_lowercase())),
    }
}

#[cfg(test)]
mod tests {
    use super::super::Keyspace;
    use super::*;

    fn args(parts: &[&str]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p.as_bytes())).collect()
    }

    #[test]
    fn test_set_get_roundtrip() {
        let keyspace = Keyspace::new(1);
        let applied = keyspace.apply(0, &args(&["set", "a", "1"])).unwrap();
        assert_eq!(applied.reply, Frame::ok());
        assert_eq!(applied.propagate, Some(args(&["SET", "a", "1"])));

        let applied = keyspace.apply(0, &args(&["GET", "a"])).unwrap();
        assert_eq!(applied.reply, Frame::bulk("1"));
        assert!(applied.propagate.is_none());
    }

    #[test]
    fn test_set_ex_propagates_absolute_deadline() {
        let keyspace = Keyspace::new(1);
        let applied = keyspace.apply(0, &args(&["SET", "a", "1", "EX", "100"])).unwrap();
        let propagate = applied.propagate.unwrap();
        assert_eq!(propagate.len(), 5);
        assert_eq!(&propagate[3][..], b"PXAT");
        let deadline: u64 = std::str::from_utf8(&propagate[4]).unwrap().parse().unwrap();
        assert!(deadline > super::super::now_ms());
    }

    #[test]
    fn test_noop_writes_are_not_propagated() {
        let keyspace = Keyspace::new(1);
        assert!(keyspace.apply(0, &args(&["DEL", "missing"])).unwrap().propagate.is_none());
        assert!(keyspace.apply(0, &args(&["EXPIRE", "missing", "10"])).unwrap().propagate.is_none());
        keyspace.apply(0, &args(&["SADD", "s", "x"])).unwrap();
        assert!(keyspace.apply(0, &args(&["SADD", "s", "x"])).unwrap().propagate.is_none());
    }

    #[test]
    fn test_expire_in_past_becomes_del() {
        let keyspace = Keyspace::new(1);
        keyspace.apply(0, &args(&["SET", "a", "1"])).unwrap();
        let applied = keyspace.apply(0, &args(&["EXPIRE", "a", "-1"])).unwrap();
        assert_eq!(applied.propagate, Some(args(&["DEL", "a"])));
        assert_eq!(keyspace.dbsize(0), 0);
    }

    #[test]
    fn test_incr_and_wrong_type() {
        let keyspace = Keyspace::new(1);
        assert_eq!(keyspace.apply(0, &args(&["INCR", "n"])).unwrap().reply, Frame::Integer(1));
        assert_eq!(
            keyspace.apply(0, &args(&["INCRBY", "n", "41"])).unwrap().reply,
            Frame::Integer(42)
        );
        keyspace.apply(0, &args(&["LPUSH", "l", "x"])).unwrap();
        assert_eq!(
            keyspace.apply(0, &args(&["INCR", "l"])).unwrap_err(),
            KeyspaceError::WrongType
        );
    }

    #[test]
    fn test_list_operations() {
        let keyspace = Keyspace::new(1);
        keyspace.apply(0, &args(&["RPUSH", "l", "a", "b", "c"])).unwrap();
        keyspace.apply(0, &args(&["LPUSH", "l", "z"])).unwrap();
        let reply = keyspace.apply(0, &args(&["LRANGE", "l", "0", "-1"])).unwrap().reply;
        assert_eq!(
            reply,
            Frame::Array(vec![
                Frame::bulk("z"),
                Frame::bulk("a"),
                Frame::bulk("b"),
                Frame::bulk("c")
            ])
        );
        assert_eq!(keyspace.apply(0, &args(&["LPOP", "l"])).unwrap().reply, Frame::bulk("z"));
    }

    #[test]
    fn test_flushall_clears_every_database() {
        let keyspace = Keyspace::new(3);
        keyspace.apply(0, &args(&["SET", "a", "1"])).unwrap();
        keyspace.apply(2, &args(&["SET", "b", "2"])).unwrap();
        keyspace.apply(1, &args(&["FLUSHALL"])).unwrap();
        assert_eq!(keyspace.dbsize(0), 0);
        assert_eq!(keyspace.dbsize(2), 0);
    }

    #[test]
    fn test_classification() {
        assert!(is_write_command(&args(&["set", "a", "b"])));
        assert!(!is_write_command(&args(&["get", "a"])));
        assert_eq!(command_kind("NOPE"), CommandKind::Unknown);
    }
}
