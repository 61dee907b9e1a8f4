//! Durable relational state: `mac`, `ip`, `arp_count`, `dns_name`,
//! `dns_record`, `aitm_opt`, `attack`, `port`, `attack_port` (spec.md §3, §6).
//!
//! A single writer connection serialises every write (spec.md §5); readers
//! use a small pool of read-only connections. Both pools are built on
//! `r2d2` + `r2d2_sqlite`.

use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};

use crate::addr::Transport;
use crate::error::{Error, Result};
use crate::model::{Attack, DiscoveryMethod, DnsRecordKind, Ip, Mac, SnacRow};

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS mac (
    id INTEGER PRIMARY KEY,
    value TEXT NOT NULL UNIQUE,
    discovery_method TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ip (
    id INTEGER PRIMARY KEY,
    value TEXT NOT NULL UNIQUE,
    mac_id INTEGER REFERENCES mac(id) ON DELETE SET NULL,
    discovery_method TEXT NOT NULL,
    arp_resolved INTEGER NOT NULL DEFAULT 0,
    ptr_resolved INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS arp_count (
    sender_ip_id INTEGER NOT NULL REFERENCES ip(id) ON DELETE CASCADE,
    target_ip_id INTEGER NOT NULL REFERENCES ip(id) ON DELETE CASCADE,
    count INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (sender_ip_id, target_ip_id)
);

CREATE TABLE IF NOT EXISTS dns_name (
    id INTEGER PRIMARY KEY,
    value TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS dns_record (
    ip_id INTEGER NOT NULL REFERENCES ip(id) ON DELETE CASCADE,
    name_id INTEGER NOT NULL REFERENCES dns_name(id) ON DELETE CASCADE,
    kind TEXT NOT NULL CHECK (kind IN ('a', 'ptr')),
    PRIMARY KEY (ip_id, name_id, kind)
);

CREATE TABLE IF NOT EXISTS aitm_opt (
    snac_ip_id INTEGER NOT NULL REFERENCES ip(id) ON DELETE CASCADE,
    downstream_ip_id INTEGER NOT NULL REFERENCES ip(id) ON DELETE CASCADE,
    PRIMARY KEY (snac_ip_id, downstream_ip_id)
);

CREATE TABLE IF NOT EXISTS attack (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_ip_id INTEGER NOT NULL REFERENCES ip(id) ON DELETE CASCADE,
    target_ip_id INTEGER NOT NULL REFERENCES ip(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS port (
    id INTEGER PRIMARY KEY,
    number INTEGER NOT NULL,
    protocol TEXT NOT NULL,
    UNIQUE (number, protocol)
);

CREATE TABLE IF NOT EXISTS attack_port (
    attack_id INTEGER NOT NULL REFERENCES attack(id) ON DELETE CASCADE,
    port_id INTEGER NOT NULL REFERENCES port(id) ON DELETE CASCADE,
    PRIMARY KEY (attack_id, port_id)
);

CREATE TRIGGER IF NOT EXISTS trg_mac_orphan_on_ip_delete
AFTER DELETE ON ip
WHEN old.mac_id IS NOT NULL
BEGIN
    DELETE FROM mac WHERE id = old.mac_id AND NOT EXISTS (SELECT 1 FROM ip WHERE mac_id = old.mac_id);
END;

CREATE TRIGGER IF NOT EXISTS trg_mac_orphan_on_ip_update
AFTER UPDATE OF mac_id ON ip
WHEN old.mac_id IS NOT NULL AND old.mac_id IS NOT new.mac_id
BEGIN
    DELETE FROM mac WHERE id = old.mac_id AND NOT EXISTS (SELECT 1 FROM ip WHERE mac_id = old.mac_id);
END;
"#;

/// Durable relational store. The writer pool is capped at a single
/// connection (spec.md §5: `max_open_conns=1`); the reader pool serves
/// concurrent read-only connections.
pub struct Store {
    writer: Pool<SqliteConnectionManager>,
    reader: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Opens (creating if absent) the database at `path` and idempotently
    /// applies the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let writer_mgr = SqliteConnectionManager::file(path).with_init(|c| {
            c.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
        });
        let writer = Pool::builder().max_size(1).build(writer_mgr)?;

        let reader_mgr = SqliteConnectionManager::file(path)
            .with_flags(rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_URI)
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let reader = Pool::builder().max_size(4).build(reader_mgr)?;

        let store = Store { writer, reader };
        store.apply_schema()?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    #[cfg(any(test, feature = "test-util"))]
    pub fn open_memory() -> Result<Self> {
        // A single shared pool stands in for the writer/reader split: an
        // unshared `:memory:` database per connection would give the
        // writer and reader pools disjoint databases.
        let mgr = SqliteConnectionManager::memory();
        let writer = Pool::builder().max_size(1).build(mgr)?;
        let reader = writer.clone();
        let store = Store { writer, reader };
        store.apply_schema()?;
        Ok(store)
    }

    fn apply_schema(&self) -> Result<()> {
        let conn = self.writer.get()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // -- mac / ip ---------------------------------------------------------

    /// Inserts the MAC if absent; returns its row id either way.
    pub fn upsert_mac(&self, value: &str, method: DiscoveryMethod) -> Result<i64> {
        let conn = self.writer.get()?;
        conn.execute(
            "INSERT INTO mac (value, discovery_method) VALUES (?1, ?2)
             ON CONFLICT(value) DO NOTHING",
            params![value, method.to_string()],
        )?;
        let id: i64 = conn.query_row("SELECT id FROM mac WHERE value = ?1", params![value], |r| r.get(0))?;
        Ok(id)
    }

    /// Inserts the IP if absent; returns its row id either way. Does not
    /// overwrite an existing `mac_id`.
    pub fn upsert_ip(&self, value: Ipv4Addr, method: DiscoveryMethod) -> Result<i64> {
        let conn = self.writer.get()?;
        let value = value.to_string();
        conn.execute(
            "INSERT INTO ip (value, discovery_method) VALUES (?1, ?2)
             ON CONFLICT(value) DO NOTHING",
            params![value, method.to_string()],
        )?;
        let id: i64 = conn.query_row("SELECT id FROM ip WHERE value = ?1", params![value], |r| r.get(0))?;
        Ok(id)
    }

    /// Binds `ip_id` to `mac_id`, e.g. on receipt of an ARP reply.
    pub fn set_ip_mac(&self, ip_id: i64, mac_id: i64) -> Result<()> {
        let conn = self.writer.get()?;
        conn.execute("UPDATE ip SET mac_id = ?1 WHERE id = ?2", params![mac_id, ip_id])?;
        Ok(())
    }

    pub fn mark_arp_resolved(&self, ip_id: i64) -> Result<()> {
        let conn = self.writer.get()?;
        conn.execute("UPDATE ip SET arp_resolved = 1 WHERE id = ?1", params![ip_id])?;
        Ok(())
    }

    pub fn mark_ptr_resolved(&self, ip_id: i64) -> Result<()> {
        let conn = self.writer.get()?;
        conn.execute("UPDATE ip SET ptr_resolved = 1 WHERE id = ?1", params![ip_id])?;
        Ok(())
    }

    pub fn get_ip(&self, value: Ipv4Addr) -> Result<Option<Ip>> {
        let conn = self.reader.get()?;
        conn.query_row(
            "SELECT id, value, mac_id, discovery_method, arp_resolved, ptr_resolved
             FROM ip WHERE value = ?1",
            params![value.to_string()],
            Self::row_to_ip,
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn get_mac(&self, value: &str) -> Result<Option<Mac>> {
        let conn = self.reader.get()?;
        conn.query_row(
            "SELECT id, value, discovery_method FROM mac WHERE value = ?1",
            params![value],
            |r| {
                Ok(Mac {
                    id: r.get(0)?,
                    value: r.get(1)?,
                    discovery_method: DiscoveryMethod::from_str(&r.get::<_, String>(2)?)
                        .unwrap_or(DiscoveryMethod::PassiveArp),
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    /// The MAC address currently bound to `ip`, if any, used by the
    /// poisoning loop to address its forged ARP replies directly to the
    /// victim instead of broadcasting them.
    pub fn mac_value_for_ip(&self, ip: Ipv4Addr) -> Result<Option<String>> {
        let conn = self.reader.get()?;
        conn.query_row(
            "SELECT mac.value FROM ip JOIN mac ON mac.id = ip.mac_id WHERE ip.value = ?1",
            params![ip.to_string()],
            |r| r.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_ip(r: &rusqlite::Row<'_>) -> rusqlite::Result<Ip> {
        let method: String = r.get(3)?;
        Ok(Ip {
            id: r.get(0)?,
            value: r.get::<_, String>(1)?.parse().unwrap_or(Ipv4Addr::UNSPECIFIED),
            mac_id: r.get(2)?,
            discovery_method: DiscoveryMethod::from_str(&method).unwrap_or(DiscoveryMethod::PassiveArp),
            arp_resolved: r.get(4)?,
            ptr_resolved: r.get(5)?,
        })
    }

    // -- arp conversation counter ------------------------------------------

    /// Increments `arp_count[(sender_ip, target_ip)]`, creating the row if
    /// absent. Returns `(new_count, transitioned_zero_to_one)`.
    pub fn increment_arp_count(&self, sender_ip_id: i64, target_ip_id: i64) -> Result<(i64, bool)> {
        let conn = self.writer.get()?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT count FROM arp_count WHERE sender_ip_id = ?1 AND target_ip_id = ?2",
                params![sender_ip_id, target_ip_id],
                |r| r.get(0),
            )
            .optional()?;
        match existing {
            None => {
                conn.execute(
                    "INSERT INTO arp_count (sender_ip_id, target_ip_id, count) VALUES (?1, ?2, 1)",
                    params![sender_ip_id, target_ip_id],
                )?;
                Ok((1, true))
            }
            Some(count) => {
                let new_count = count + 1;
                conn.execute(
                    "UPDATE arp_count SET count = ?1 WHERE sender_ip_id = ?2 AND target_ip_id = ?3",
                    params![new_count, sender_ip_id, target_ip_id],
                )?;
                Ok((new_count, false))
            }
        }
    }

    // -- dns ----------------------------------------------------------------

    pub fn ensure_dns_name(&self, value: &str) -> Result<i64> {
        let conn = self.writer.get()?;
        conn.execute(
            "INSERT INTO dns_name (value) VALUES (?1) ON CONFLICT(value) DO NOTHING",
            params![value],
        )?;
        let id = conn.query_row("SELECT id FROM dns_name WHERE value = ?1", params![value], |r| r.get(0))?;
        Ok(id)
    }

    pub fn insert_dns_record(&self, ip_id: i64, name_id: i64, kind: DnsRecordKind) -> Result<()> {
        let conn = self.writer.get()?;
        conn.execute(
            "INSERT INTO dns_record (ip_id, name_id, kind) VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
            params![ip_id, name_id, kind.to_string()],
        )?;
        Ok(())
    }

    pub fn insert_aitm_opportunity(&self, snac_ip_id: i64, downstream_ip_id: i64) -> Result<()> {
        let conn = self.writer.get()?;
        conn.execute(
            "INSERT INTO aitm_opt (snac_ip_id, downstream_ip_id) VALUES (?1, ?2)
             ON CONFLICT DO NOTHING",
            params![snac_ip_id, downstream_ip_id],
        )?;
        Ok(())
    }

    /// A-record names known for `ip`, used by the TCP proxy to build SAN
    /// DNS names for a minted downstream certificate.
    pub fn a_record_names_for_ip(&self, ip: Ipv4Addr) -> Result<Vec<String>> {
        let conn = self.reader.get()?;
        let mut stmt = conn.prepare(
            "SELECT dns_name.value FROM dns_record
             JOIN ip ON ip.id = dns_record.ip_id
             JOIN dns_name ON dns_name.id = dns_record.name_id
             WHERE ip.value = ?1 AND dns_record.kind = 'a'",
        )?;
        let rows = stmt.query_map(params![ip.to_string()], |r| r.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    // -- attacks --------------------------------------------------------------

    pub fn create_attack(&self, sender_ip_id: i64, target_ip_id: i64) -> Result<i64> {
        let conn = self.writer.get()?;
        conn.execute(
            "INSERT INTO attack (sender_ip_id, target_ip_id) VALUES (?1, ?2)",
            params![sender_ip_id, target_ip_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_attack_port(&self, attack_id: i64, number: u16, protocol: Transport) -> Result<()> {
        let conn = self.writer.get()?;
        conn.execute(
            "INSERT INTO port (number, protocol) VALUES (?1, ?2) ON CONFLICT(number, protocol) DO NOTHING",
            params![number, protocol.to_string()],
        )?;
        let port_id: i64 = conn.query_row(
            "SELECT id FROM port WHERE number = ?1 AND protocol = ?2",
            params![number, protocol.to_string()],
            |r| r.get(0),
        )?;
        conn.execute(
            "INSERT INTO attack_port (attack_id, port_id) VALUES (?1, ?2) ON CONFLICT DO NOTHING",
            params![attack_id, port_id],
        )?;
        Ok(())
    }

    pub fn get_attack(&self, id: i64) -> Result<Option<Attack>> {
        let conn = self.reader.get()?;
        conn.query_row(
            "SELECT attack.id, sender.value, target.value
             FROM attack
             JOIN ip AS sender ON sender.id = attack.sender_ip_id
             JOIN ip AS target ON target.id = attack.target_ip_id
             WHERE attack.id = ?1",
            params![id],
            |r| {
                Ok(Attack {
                    id: r.get(0)?,
                    sender_ip: r.get::<_, String>(1)?.parse().unwrap_or(Ipv4Addr::UNSPECIFIED),
                    target_ip: r.get::<_, String>(2)?.parse().unwrap_or(Ipv4Addr::UNSPECIFIED),
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    /// Downstream candidates recorded for a SNAC target IP, used to pick
    /// a relay destination when launching an attack against it.
    pub fn aitm_opportunities_for(&self, snac_ip: Ipv4Addr) -> Result<Vec<Ipv4Addr>> {
        let conn = self.reader.get()?;
        let mut stmt = conn.prepare(
            "SELECT downstream.value FROM aitm_opt
             JOIN ip AS snac ON snac.id = aitm_opt.snac_ip_id
             JOIN ip AS downstream ON downstream.id = aitm_opt.downstream_ip_id
             WHERE snac.value = ?1",
        )?;
        let rows = stmt.query_map(params![snac_ip.to_string()], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.parse().unwrap_or(Ipv4Addr::UNSPECIFIED));
        }
        Ok(out)
    }

    // -- reporting --------------------------------------------------------------

    /// Drives `dump-snacs`: one row per SNAC target IP, joined against the
    /// conversations that named it, the attacks launched against it, and
    /// the distinct ports observed across those attacks.
    pub fn dump_snacs(&self) -> Result<Vec<SnacRow>> {
        let conn = self.reader.get()?;
        let mut stmt = conn.prepare(
            "SELECT sender.value, target.value, arp_count.count,
                    (SELECT COUNT(*) FROM attack
                        WHERE attack.sender_ip_id = arp_count.sender_ip_id
                          AND attack.target_ip_id = arp_count.target_ip_id) AS attack_count,
                    (SELECT COUNT(DISTINCT attack_port.port_id) FROM attack_port
                        JOIN attack ON attack.id = attack_port.attack_id
                        WHERE attack.sender_ip_id = arp_count.sender_ip_id
                          AND attack.target_ip_id = arp_count.target_ip_id) AS port_count
             FROM arp_count
             JOIN ip AS sender ON sender.id = arp_count.sender_ip_id
             JOIN ip AS target ON target.id = arp_count.target_ip_id
             WHERE target.arp_resolved = 1 AND target.mac_id IS NULL
             ORDER BY sender.value, target.value",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(SnacRow {
                sender_ip: r.get::<_, String>(0)?.parse().unwrap_or(Ipv4Addr::UNSPECIFIED),
                target_ip: r.get::<_, String>(1)?.parse().unwrap_or(Ipv4Addr::UNSPECIFIED),
                arp_count: r.get(2)?,
                attack_count: r.get(3)?,
                port_count: r.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_memory().unwrap()
    }

    #[test]
    fn schema_apply_is_idempotent() {
        let s = store();
        s.apply_schema().unwrap();
        s.apply_schema().unwrap();
    }

    #[test]
    fn passive_discovery_scenario() {
        // spec.md §8 scenario 1
        let s = store();
        let sender_mac = s.upsert_mac("aa:aa:aa:aa:aa:01", DiscoveryMethod::PassiveArp).unwrap();
        let sender_ip = s
            .upsert_ip("10.0.0.10".parse().unwrap(), DiscoveryMethod::PassiveArp)
            .unwrap();
        s.set_ip_mac(sender_ip, sender_mac).unwrap();
        s.mark_arp_resolved(sender_ip).unwrap();
        let target_ip = s
            .upsert_ip("10.0.0.20".parse().unwrap(), DiscoveryMethod::PassiveArp)
            .unwrap();
        let (count, transitioned) = s.increment_arp_count(sender_ip, target_ip).unwrap();
        assert_eq!(count, 1);
        assert!(transitioned);

        let sender = s.get_ip("10.0.0.10".parse().unwrap()).unwrap().unwrap();
        assert!(sender.arp_resolved);
        assert_eq!(sender.mac_id, Some(sender_mac));
        let target = s.get_ip("10.0.0.20".parse().unwrap()).unwrap().unwrap();
        assert!(!target.arp_resolved);
        assert!(!target.is_snac());
    }

    #[test]
    fn snac_confirmation_scenario() {
        // spec.md §8 scenario 2
        let s = store();
        let target_ip = s
            .upsert_ip("10.0.0.20".parse().unwrap(), DiscoveryMethod::PassiveArp)
            .unwrap();
        s.mark_arp_resolved(target_ip).unwrap();
        let target = s.get_ip("10.0.0.20".parse().unwrap()).unwrap().unwrap();
        assert!(target.mac_id.is_none());
        assert!(target.is_snac());
    }

    #[test]
    fn aitm_discovery_scenario() {
        // spec.md §8 scenario 3
        let s = store();
        let snac = s
            .upsert_ip("10.0.0.20".parse().unwrap(), DiscoveryMethod::PassiveArp)
            .unwrap();
        let name_id = s.ensure_dns_name("host.example").unwrap();
        s.insert_dns_record(snac, name_id, DnsRecordKind::Ptr).unwrap();
        s.mark_ptr_resolved(snac).unwrap();

        let downstream = s
            .upsert_ip("10.0.0.30".parse().unwrap(), DiscoveryMethod::ForwardDns)
            .unwrap();
        s.insert_dns_record(downstream, name_id, DnsRecordKind::A).unwrap();
        s.insert_aitm_opportunity(snac, downstream).unwrap();

        let names = s.a_record_names_for_ip("10.0.0.30".parse().unwrap()).unwrap();
        assert_eq!(names, vec!["host.example".to_string()]);

        let downstreams = s.aitm_opportunities_for("10.0.0.20".parse().unwrap()).unwrap();
        assert_eq!(downstreams, vec!["10.0.0.30".parse::<Ipv4Addr>().unwrap()]);
    }

    #[test]
    fn orphaned_mac_is_deleted_when_last_ip_is_removed() {
        let s = store();
        let mac_id = s.upsert_mac("aa:aa:aa:aa:aa:02", DiscoveryMethod::PassiveArp).unwrap();
        let ip_id = s
            .upsert_ip("10.0.0.11".parse().unwrap(), DiscoveryMethod::PassiveArp)
            .unwrap();
        s.set_ip_mac(ip_id, mac_id).unwrap();

        let conn = s.writer.get().unwrap();
        conn.execute("DELETE FROM ip WHERE id = ?1", params![ip_id]).unwrap();
        drop(conn);

        assert!(s.get_mac("aa:aa:aa:aa:aa:02").unwrap().is_none());
    }

    #[test]
    fn dump_snacs_reports_unresolved_targets_only() {
        let s = store();
        let sender = s
            .upsert_ip("10.0.0.10".parse().unwrap(), DiscoveryMethod::PassiveArp)
            .unwrap();
        let target = s
            .upsert_ip("10.0.0.20".parse().unwrap(), DiscoveryMethod::PassiveArp)
            .unwrap();
        s.increment_arp_count(sender, target).unwrap();
        s.mark_arp_resolved(target).unwrap();

        let rows = s.dump_snacs().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].arp_count, 1);
        assert_eq!(rows[0].attack_count, 0);
    }
}
