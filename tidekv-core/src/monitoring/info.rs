//! `INFO` rendering

use std::fmt::Write;

/// One connected replica as seen by its primary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub ip: String,
    pub port: u16,
    pub state: &'static str,
    pub offset: u64,
    pub lag: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogInfo {
    pub size: usize,
    pub first_byte_offset: u64,
    pub histlen: u64,
}

/// Upstream link of a replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterInfo {
    pub host: String,
    pub port: u16,
    pub link_up: bool,
    pub last_io_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceInfo {
    pub bgsave_in_progress: bool,
    pub changes_since_last_save: u64,
    pub last_save_time: i64,
    pub last_bgsave_ok: bool,
    pub aof_enabled: bool,
    pub aof_current_segment: Option<u64>,
}

/// Point-in-time view of replication and persistence state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub role: &'static str,
    pub run_id: String,
    pub offset: u64,
    pub replicas: Vec<ReplicaInfo>,
    pub backlog: Option<BacklogInfo>,
    pub master: Option<MasterInfo>,
    pub persistence: PersistenceInfo,
}

/// Render `INFO [section]`. Unknown sections render empty.
pub fn render_info(info: &ServerInfo, section: Option<&str>) -> String {
    let section = section.map(str::to_ascii_lowercase);
    let wants = |name: &str| match section.as_deref() {
        None | Some("all") | Some("default") | Some("everything") => true,
        Some(s) => s == name,
    };

    let mut out = String::new();
    if wants("replication") {
        render_replication(info, &mut out);
    }
    if wants("persistence") {
        if !out.is_empty() {
            out.push_str("\r\n");
        }
        render_persistence(&info.persistence, &mut out);
    }
    out
}

fn render_replication(info: &ServerInfo, out: &mut String) {
    let _ = write!(out, "# Replication\r\nrole:{}\r\n", info.role);

    if let Some(master) = &info.master {
        let _ = write!(
            out,
            "master_host:{}\r\nmaster_port:{}\r\nmaster_link_status:{}\r\nmaster_last_io_seconds_ago:{}\r\nslave_repl_offset:{}\r\n",
            master.host,
            master.port,
            if master.link_up { "up" } else { "down" },
            master.last_io_secs,
            info.offset
        );
    }

    let _ = write!(out, "connected_slaves:{}\r\n", info.replicas.len());
    for (index, replica) in info.replicas.iter().enumerate() {
        let _ = write!(
            out,
            "slave{}:ip={},port={},state={},offset={},lag={}\r\n",
            index, replica.ip, replica.port, replica.state, replica.offset, replica.lag
        );
    }

    let _ = write!(
        out,
        "master_replid:{}\r\nmaster_repl_offset:{}\r\n",
        info.run_id, info.offset
    );
    match &info.backlog {
        Some(backlog) => {
            let _ = write!(
                out,
                "repl_backlog_active:1\r\nrepl_backlog_size:{}\r\nrepl_backlog_first_byte_offset:{}\r\nrepl_backlog_histlen:{}\r\n",
                backlog.size, backlog.first_byte_offset, backlog.histlen
            );
        }
        None => out.push_str(
            "repl_backlog_active:0\r\nrepl_backlog_size:0\r\nrepl_backlog_first_byte_offset:0\r\nrepl_backlog_histlen:0\r\n",
        ),
    }
}

fn render_persistence(info: &PersistenceInfo, out: &mut String) {
    let _ = write!(
        out,
        "# Persistence\r\nrdb_changes_since_last_save:{}\r\nrdb_bgsave_in_progress:{}\r\nrdb_last_save_time:{}\r\nrdb_last_bgsave_status:{}\r\naof_enabled:{}\r\n",
        info.changes_since_last_save,
        info.bgsave_in_progress as u8,
        info.last_save_time,
        if info.last_bgsave_ok { "ok" } else { "err" },
        info.aof_enabled as u8
    );
    if let Some(segment) = info.aof_current_segment {
        let _ = write!(out, "aof_current_segment:{}\r\n", segment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServerInfo {
        ServerInfo {
            role: "master",
            run_id: "a".repeat(40),
            offset: 120,
            replicas: vec![ReplicaInfo {
                ip: "127.0.0.1".to_string(),
                port: 7001,
                state: "online",
                offset: 100,
                lag: 0,
            }],
            backlog: Some(BacklogInfo {
                size: 1024,
                first_byte_offset: 0,
                histlen: 120,
            }),
            master: None,
            persistence: PersistenceInfo {
                bgsave_in_progress: false,
                changes_since_last_save: 3,
                last_save_time: 1_700_000_000,
                last_bgsave_ok: true,
                aof_enabled: true,
                aof_current_segment: Some(2),
            },
        }
    }

    #[test]
    fn test_replication_section() {
        let text = render_info(&sample(), Some("replication"));
        assert!(text.starts_with("# Replication\r\nrole:master\r\n"));
        assert!(text.contains("connected_slaves:1\r\n"));
        assert!(text.contains("slave0:ip=127.0.0.1,port=7001,state=online,offset=100,lag=0\r\n"));
        assert!(text.contains("master_repl_offset:120\r\n"));
        assert!(text.contains("repl_backlog_histlen:120\r\n"));
        assert!(!text.contains("# Persistence"));
    }

    #[test]
    fn test_replica_fields_and_all_sections() {
        let mut info = sample();
        info.role = "slave";
        info.master = Some(MasterInfo {
            host: "10.0.0.1".to_string(),
            port: 6379,
            link_up: false,
            last_io_secs: 4,
        });
        let text = render_info(&info, None);
        assert!(text.contains("master_host:10.0.0.1\r\n"));
        assert!(text.contains("master_link_status:down\r\n"));
        assert!(text.contains("# Persistence\r\n"));
        assert!(text.contains("aof_current_segment:2\r\n"));
        assert!(render_info(&info, Some("keyspace")).is_empty());
    }
}
