// Copyright (C) 2026 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Registry backed by a SQLite file shared with the application that issues connection ids.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;
use uuid::Uuid;
use wsrelay_common::Fd;

use crate::connections::registry::{ConnectionRegistry, RegistryError};
use crate::connections::{
    ConnectionRecord, NewConnection, ServerId, millis_since_epoch, time_from_millis,
};

/// How long a statement waits on a lock held by another process before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS connections (
    connection_id TEXT PRIMARY KEY NOT NULL,
    session_id    TEXT NOT NULL,
    ip            TEXT NOT NULL,
    user_id       INTEGER,
    user_agent_id INTEGER NOT NULL,
    server_id     TEXT,
    fd            INTEGER,
    opened        INTEGER,
    closed        INTEGER
);
CREATE INDEX IF NOT EXISTS connections_server_fd ON connections (server_id, fd);
CREATE INDEX IF NOT EXISTS connections_user ON connections (user_id);
CREATE INDEX IF NOT EXISTS connections_session ON connections (session_id);
";

pub struct SqliteRegistry {
    conn: Mutex<Connection>,
}

impl SqliteRegistry {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(?path, journal_mode = mode, "Opened registry database");
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// A private, non-persistent database with the same schema.
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn.lock().map_err(|_| RegistryError::Poisoned)
    }

    fn live_fds(
        &self,
        sql: &str,
        server_id: &ServerId,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Vec<Fd>, RegistryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let fds = stmt
            .query_map(params![server_id.as_str(), param], |row| row.get::<_, Fd>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(fds)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(String, ConnectionRecord)> {
    let raw_id: String = row.get("connection_id")?;
    let server_id: Option<String> = row.get("server_id")?;
    let opened: Option<i64> = row.get("opened")?;
    let closed: Option<i64> = row.get("closed")?;
    Ok((
        raw_id,
        ConnectionRecord {
            connection_id: Uuid::nil(),
            session_id: row.get("session_id")?,
            ip: row.get("ip")?,
            user_id: row.get("user_id")?,
            user_agent_id: row.get("user_agent_id")?,
            server_id: server_id.map(ServerId::from),
            fd: row.get("fd")?,
            opened: opened.map(time_from_millis),
            closed: closed.map(time_from_millis),
        },
    ))
}

impl ConnectionRegistry for SqliteRegistry {
    fn open(
        &self,
        connection_id: Uuid,
        server_id: &ServerId,
        fd: Fd,
    ) -> Result<usize, RegistryError> {
        let mut conn = self.conn()?;
        let now = millis_since_epoch(SystemTime::now());
        let id = connection_id.to_string();
        let tx = conn.transaction()?;
        let claimed = tx.execute(
            "UPDATE connections SET server_id = ?1, fd = ?2, opened = ?3, closed = NULL
             WHERE connection_id = ?4",
            params![server_id.as_str(), fd, now, id],
        )?;
        if claimed > 0 {
            let displaced = tx.execute(
                "UPDATE connections SET closed = ?1
                 WHERE server_id = ?2 AND fd = ?3 AND closed IS NULL AND connection_id != ?4",
                params![now, server_id.as_str(), fd, id],
            )?;
            if displaced > 0 {
                debug!(fd, displaced, "Closed rows still claiming a reused descriptor");
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    fn close(&self, server_id: &ServerId, fd: Fd) -> Result<usize, RegistryError> {
        let conn = self.conn()?;
        let now = millis_since_epoch(SystemTime::now());
        Ok(conn.execute(
            "UPDATE connections SET closed = ?1
             WHERE server_id = ?2 AND fd = ?3 AND closed IS NULL",
            params![now, server_id.as_str(), fd],
        )?)
    }

    fn issue(&self, connection: NewConnection) -> Result<Uuid, RegistryError> {
        let conn = self.conn()?;
        let connection_id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO connections (connection_id, session_id, ip, user_id, user_agent_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                connection_id.to_string(),
                connection.session_id,
                connection.ip,
                connection.user_id,
                connection.user_agent_id,
            ],
        )?;
        Ok(connection_id)
    }

    fn sweep_stale(&self, current: &ServerId) -> Result<usize, RegistryError> {
        let conn = self.conn()?;
        let now = millis_since_epoch(SystemTime::now());
        Ok(conn.execute(
            "UPDATE connections SET closed = ?1
             WHERE closed IS NULL AND server_id IS NOT NULL AND server_id != ?2",
            params![now, current.as_str()],
        )?)
    }

    fn live_fds_for_user(
        &self,
        server_id: &ServerId,
        user_id: i64,
    ) -> Result<Vec<Fd>, RegistryError> {
        self.live_fds(
            "SELECT fd FROM connections
             WHERE server_id = ?1 AND user_id = ?2 AND closed IS NULL AND fd IS NOT NULL
             ORDER BY fd",
            server_id,
            &user_id,
        )
    }

    fn live_fds_for_session(
        &self,
        server_id: &ServerId,
        session_id: &str,
    ) -> Result<Vec<Fd>, RegistryError> {
        self.live_fds(
            "SELECT fd FROM connections
             WHERE server_id = ?1 AND session_id = ?2 AND closed IS NULL AND fd IS NOT NULL
             ORDER BY fd",
            server_id,
            &session_id,
        )
    }

    fn get(&self, connection_id: Uuid) -> Result<Option<ConnectionRecord>, RegistryError> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT * FROM connections WHERE connection_id = ?1",
                params![connection_id.to_string()],
                record_from_row,
            )
            .optional()?;
        let Some((raw_id, mut record)) = found else {
            return Ok(None);
        };
        record.connection_id = Uuid::parse_str(&raw_id)
            .map_err(|e| RegistryError::Corrupt(format!("connection_id {raw_id:?}: {e}")))?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> (tempfile::TempDir, SqliteRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteRegistry::open(&dir.path().join("connections.db")).unwrap();
        (dir, db)
    }

    fn issue(db: &SqliteRegistry, session: &str, user_id: Option<i64>) -> Uuid {
        db.issue(NewConnection {
            session_id: session.to_string(),
            ip: "192.0.2.10".to_string(),
            user_id,
            user_agent_id: 1,
        })
        .unwrap()
    }

    #[test]
    fn issued_row_starts_unclaimed() {
        let (_dir, db) = registry();
        let id = issue(&db, "s1", Some(77));
        let record = db.get(id).unwrap().unwrap();
        assert_eq!(record.connection_id, id);
        assert_eq!(record.session_id, "s1");
        assert_eq!(record.user_id, Some(77));
        assert_eq!(record.server_id, None);
        assert_eq!(record.fd, None);
        assert_eq!(record.opened, None);
    }

    #[test]
    fn open_and_close_round() {
        let (_dir, db) = registry();
        let server = ServerId::from("1700000000000.42");
        let id = issue(&db, "s1", Some(77));

        assert_eq!(db.open(id, &server, 12).unwrap(), 1);
        let record = db.get(id).unwrap().unwrap();
        assert!(record.is_live_on(&server));
        assert!(record.opened.is_some());
        assert_eq!(db.live_fds_for_user(&server, 77).unwrap(), vec![12]);
        assert_eq!(db.live_fds_for_session(&server, "s1").unwrap(), vec![12]);

        assert_eq!(db.close(&server, 12).unwrap(), 1);
        assert_eq!(db.close(&server, 12).unwrap(), 0);
        assert!(db.live_fds_for_user(&server, 77).unwrap().is_empty());
    }

    #[test]
    fn unknown_identifier_updates_zero_rows() {
        let (_dir, db) = registry();
        issue(&db, "s1", None);
        assert_eq!(
            db.open(Uuid::new_v4(), &ServerId::from("a"), 4).unwrap(),
            0
        );
    }

    #[test]
    fn stale_instance_close_is_isolated() {
        let (_dir, db) = registry();
        let id = issue(&db, "s1", None);
        db.open(id, &ServerId::from("current"), 9).unwrap();
        assert_eq!(db.close(&ServerId::from("previous"), 9).unwrap(), 0);
        assert!(db.get(id).unwrap().unwrap().closed.is_none());
    }

    #[test]
    fn sweep_and_reuse() {
        let (_dir, db) = registry();
        let old = ServerId::from("old");
        let current = ServerId::from("current");
        let a = issue(&db, "s1", Some(5));
        let b = issue(&db, "s2", Some(5));
        let c = issue(&db, "s3", Some(5));
        db.open(a, &old, 10).unwrap();
        db.open(b, &current, 10).unwrap();

        assert_eq!(db.sweep_stale(&current).unwrap(), 1);
        assert_eq!(db.live_fds_for_user(&current, 5).unwrap(), vec![10]);

        // c takes over descriptor 10 within the current instance.
        db.open(c, &current, 10).unwrap();
        assert!(db.get(b).unwrap().unwrap().closed.is_some());
        assert_eq!(db.live_fds_for_session(&current, "s3").unwrap(), vec![10]);
    }

    #[test]
    fn targets_are_scoped_to_the_holding_instance() {
        let (_dir, db) = registry();
        let old = ServerId::from("old");
        let current = ServerId::from("current");
        let left_open = issue(&db, "s1", Some(6));
        let ours = issue(&db, "s1", Some(6));
        db.open(left_open, &old, 21).unwrap();
        db.open(ours, &current, 22).unwrap();

        assert_eq!(db.live_fds_for_user(&current, 6).unwrap(), vec![22]);
        assert_eq!(db.live_fds_for_session(&current, "s1").unwrap(), vec![22]);
        assert_eq!(db.live_fds_for_user(&old, 6).unwrap(), vec![21]);
    }

    #[test]
    fn visible_to_a_second_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let issuer = SqliteRegistry::open(&path).unwrap();
        let relay = SqliteRegistry::open(&path).unwrap();

        let id = issue(&issuer, "s1", None);
        assert_eq!(relay.open(id, &ServerId::from("relay"), 3).unwrap(), 1);
        assert_eq!(issuer.get(id).unwrap().unwrap().fd, Some(3));
    }
}
