use cardwall_protocol::{
    validate_card, Card, CardKind, CardSubmission, Error, PendingRequest, Position, Result,
    RunSummary, DEFAULT_RUN,
};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::Digest as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// SQLite-backed store for cards, runs, artifacts and the pending-request
/// queue. The single source of truth for run state in both lifecycle
/// modes; thread-mode and detached-mode instances read the same file.
#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
}

fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| Error::Storage(e.to_string()))?;
        let kernel = Self {
            db_path: dir.join("cardwall.sqlite"),
        };
        let conn = kernel.conn()?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(storage_err)?;
        Self::init_schema(&conn)?;
        Ok(kernel)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
              label TEXT PRIMARY KEY,
              created TEXT NOT NULL,
              last_activity TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cards (
              id TEXT PRIMARY KEY,
              run TEXT NOT NULL,
              seq INTEGER NOT NULL,
              kind TEXT NOT NULL,
              payload TEXT NOT NULL,
              title TEXT,
              description TEXT,
              source TEXT,
              position TEXT NOT NULL,
              created TEXT NOT NULL,
              interactive INTEGER NOT NULL DEFAULT 0,
              on_send TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_cards_run ON cards(run);
            CREATE INDEX IF NOT EXISTS idx_cards_seq ON cards(run, seq);

            -- Content-addressed selections captured from the browser.
            -- Keyed per run: the same content in two runs is two rows, so
            -- deleting one run never strands the other's artifact ids.
            CREATE TABLE IF NOT EXISTS artifacts (
              id TEXT NOT NULL,
              run TEXT NOT NULL,
              payload TEXT NOT NULL,
              created TEXT NOT NULL,
              PRIMARY KEY (id, run)
            );
            CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run);

            CREATE TABLE IF NOT EXISTS pending_requests (
              id TEXT PRIMARY KEY,
              card_id TEXT NOT NULL,
              run TEXT NOT NULL,
              prompt TEXT,
              artifact_id TEXT,
              instruction TEXT,
              created TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pending_run ON pending_requests(run);
            "#,
        )
        .map_err(storage_err)?;
        Ok(())
    }

    // Pragmas are per-connection; WAL sticks to the file but the busy
    // timeout and durability level must be reapplied on every open.
    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).map_err(storage_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(storage_err)?;
        let busy_ms: u64 = std::env::var("CARDWALL_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))
            .map_err(storage_err)?;
        Ok(conn)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Write or replace a card. A replace targeting an unknown id (or a
    /// card in another run) falls back to append unless `strict`.
    pub fn insert_card(&self, sub: &CardSubmission) -> Result<Card> {
        let kind = sub
            .kind
            .ok_or_else(|| Error::Validation("card kind is required".into()))?;
        validate_card(kind, &sub.payload, sub.title.as_deref())?;
        let run = sub
            .run
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_RUN.to_string());
        let position = sub.position.unwrap_or_default();
        let ts = now();

        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;

        // Existing replace target: same run, keep the order key.
        let existing: Option<(String, String)> = match &sub.replace {
            Some(rid) => tx
                .prepare("SELECT position, created FROM cards WHERE id=? AND run=?")
                .map_err(storage_err)?
                .query_row(params![rid, run], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()
                .map_err(storage_err)?,
            None => None,
        };
        if existing.is_none() && sub.strict {
            if let Some(rid) = &sub.replace {
                return Err(Error::NotFound(format!("no card {rid} in run {run}")));
            }
        }

        tx.execute(
            "INSERT INTO runs(label, created, last_activity) VALUES(?1, ?2, ?2)
             ON CONFLICT(label) DO UPDATE SET last_activity=?2",
            params![run, ts],
        )
        .map_err(storage_err)?;

        let payload_s = serde_json::to_string(&sub.payload)
            .map_err(|e| Error::Validation(e.to_string()))?;
        let card = match existing {
            Some((orig_pos, orig_created)) => {
                let id = sub.replace.clone().unwrap_or_default();
                tx.execute(
                    "UPDATE cards SET kind=?, payload=?, title=?, description=?, source=?,
                       interactive=?, on_send=? WHERE id=?",
                    params![
                        kind.as_str(),
                        payload_s,
                        sub.title,
                        sub.description,
                        sub.source,
                        sub.interactive as i64,
                        sub.on_send,
                        id,
                    ],
                )
                .map_err(storage_err)?;
                Card {
                    id,
                    kind,
                    payload: sub.payload.clone(),
                    title: sub.title.clone(),
                    description: sub.description.clone(),
                    source: sub.source.clone(),
                    run,
                    position: Position::from_str(&orig_pos).unwrap_or_default(),
                    created: orig_created,
                    interactive: sub.interactive,
                    on_send: sub.on_send.clone(),
                }
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                let seq: i64 = tx
                    .query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM cards", [], |row| {
                        row.get(0)
                    })
                    .map_err(storage_err)?;
                tx.execute(
                    "INSERT INTO cards(id, run, seq, kind, payload, title, description, source,
                       position, created, interactive, on_send)
                     VALUES(?,?,?,?,?,?,?,?,?,?,?,?)",
                    params![
                        id,
                        run,
                        seq,
                        kind.as_str(),
                        payload_s,
                        sub.title,
                        sub.description,
                        sub.source,
                        position.as_str(),
                        ts,
                        sub.interactive as i64,
                        sub.on_send,
                    ],
                )
                .map_err(storage_err)?;
                Card {
                    id,
                    kind,
                    payload: sub.payload.clone(),
                    title: sub.title.clone(),
                    description: sub.description.clone(),
                    source: sub.source.clone(),
                    run,
                    position,
                    created: ts,
                    interactive: sub.interactive,
                    on_send: sub.on_send.clone(),
                }
            }
        };
        tx.commit().map_err(storage_err)?;
        Ok(card)
    }

    /// Cards in render order: `top` cards most-recent-first, then the
    /// append log in write order.
    pub fn list_cards(&self, run: &str) -> Result<Vec<Card>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, run, kind, payload, title, description, source, position, created,
                   interactive, on_send
                 FROM cards WHERE run=?
                 ORDER BY CASE position WHEN 'top' THEN 0 ELSE 1 END,
                          CASE position WHEN 'top' THEN -seq ELSE seq END",
            )
            .map_err(storage_err)?;
        let mut rows = stmt.query([run]).map_err(storage_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(storage_err)? {
            out.push(map_card_row(row)?);
        }
        Ok(out)
    }

    pub fn get_card(&self, id: &str) -> Result<Option<Card>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, run, kind, payload, title, description, source, position, created,
                   interactive, on_send
                 FROM cards WHERE id=? LIMIT 1",
            )
            .map_err(storage_err)?;
        let mut rows = stmt.query([id]).map_err(storage_err)?;
        match rows.next().map_err(storage_err)? {
            Some(row) => Ok(Some(map_card_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT r.label, r.created, r.last_activity,
                   (SELECT COUNT(1) FROM cards c WHERE c.run = r.label)
                 FROM runs r ORDER BY r.last_activity DESC",
            )
            .map_err(storage_err)?;
        let mut rows = stmt.query([]).map_err(storage_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(storage_err)? {
            out.push(RunSummary {
                label: row.get(0).map_err(storage_err)?,
                created: row.get(1).map_err(storage_err)?,
                last_activity: row.get(2).map_err(storage_err)?,
                card_count: row.get::<_, i64>(3).map_err(storage_err)? as u64,
            });
        }
        Ok(out)
    }

    pub fn count_runs(&self) -> Result<u64> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(1) FROM runs", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(n as u64)
    }

    /// Remove a run and everything scoped to it in one transaction.
    /// Returns whether the run existed.
    pub fn delete_run(&self, label: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(storage_err)?;
        let existed = tx
            .execute("DELETE FROM runs WHERE label=?", [label])
            .map_err(storage_err)?
            > 0;
        tx.execute("DELETE FROM cards WHERE run=?", [label])
            .map_err(storage_err)?;
        tx.execute("DELETE FROM artifacts WHERE run=?", [label])
            .map_err(storage_err)?;
        tx.execute("DELETE FROM pending_requests WHERE run=?", [label])
            .map_err(storage_err)?;
        tx.commit().map_err(storage_err)?;
        Ok(existed)
    }

    /// Delete every run whose last activity is older than the cutoff.
    /// A zero duration removes all runs. Returns how many were deleted.
    pub fn clean_runs(&self, older_than: chrono::Duration) -> Result<usize> {
        let cutoff = (chrono::Utc::now() - older_than)
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let labels: Vec<String> = {
            let conn = self.conn()?;
            let mut stmt = conn
                .prepare("SELECT label FROM runs WHERE last_activity < ?")
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([&cutoff], |row| row.get(0))
                .map_err(storage_err)?;
            rows.collect::<std::result::Result<_, _>>().map_err(storage_err)?
        };
        for label in &labels {
            self.delete_run(label)?;
        }
        Ok(labels.len())
    }

    /// Store a browser selection, addressed by the SHA-256 of its
    /// canonical JSON. Re-storing identical content in the same run is a
    /// no-op; each run holds its own row so the id stays resolvable for
    /// as long as any run referencing it lives.
    pub fn put_artifact(&self, run: &str, payload: &serde_json::Value) -> Result<String> {
        let canonical =
            serde_json::to_string(payload).map_err(|e| Error::Validation(e.to_string()))?;
        let mut h = sha2::Sha256::new();
        h.update(canonical.as_bytes());
        let id = hex::encode(h.finalize());
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO artifacts(id, run, payload, created) VALUES(?,?,?,?)",
            params![id, run, canonical, now()],
        )
        .map_err(storage_err)?;
        Ok(id)
    }

    pub fn get_artifact(&self, id: &str) -> Result<serde_json::Value> {
        if id.len() != 64 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::Validation(format!("malformed artifact id: {id:?}")));
        }
        let conn = self.conn()?;
        let payload: Option<String> = conn
            .prepare("SELECT payload FROM artifacts WHERE id=? LIMIT 1")
            .map_err(storage_err)?
            .query_row([id], |row| row.get(0))
            .optional()
            .map_err(storage_err)?;
        let payload = payload.ok_or_else(|| Error::NotFound(format!("artifact {id}")))?;
        serde_json::from_str(&payload).map_err(|e| Error::Storage(e.to_string()))
    }

    /// Enqueue a durable pending request for the calling process.
    pub fn insert_pending(
        &self,
        card: &Card,
        prompt: Option<&str>,
        artifact_id: Option<&str>,
    ) -> Result<PendingRequest> {
        let req = PendingRequest {
            id: uuid::Uuid::new_v4().to_string(),
            card_id: card.id.clone(),
            run: card.run.clone(),
            prompt: prompt.map(|s| s.to_string()),
            artifact_id: artifact_id.map(|s| s.to_string()),
            instruction: card.on_send.clone(),
            created: now(),
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO pending_requests(id, card_id, run, prompt, artifact_id, instruction, created)
             VALUES(?,?,?,?,?,?,?)",
            params![
                req.id,
                req.card_id,
                req.run,
                req.prompt,
                req.artifact_id,
                req.instruction,
                req.created,
            ],
        )
        .map_err(storage_err)?;
        Ok(req)
    }

    /// Unacknowledged requests in insertion order, oldest first. The
    /// timestamp only has millisecond precision, so ordering goes by
    /// rowid. A request keeps coming back until `ack_pending` retires it.
    pub fn list_pending(&self) -> Result<Vec<PendingRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, card_id, run, prompt, artifact_id, instruction, created
                 FROM pending_requests ORDER BY rowid ASC",
            )
            .map_err(storage_err)?;
        let mut rows = stmt.query([]).map_err(storage_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(storage_err)? {
            out.push(PendingRequest {
                id: row.get(0).map_err(storage_err)?,
                card_id: row.get(1).map_err(storage_err)?,
                run: row.get(2).map_err(storage_err)?,
                prompt: row.get(3).map_err(storage_err)?,
                artifact_id: row.get(4).map_err(storage_err)?,
                instruction: row.get(5).map_err(storage_err)?,
                created: row.get(6).map_err(storage_err)?,
            });
        }
        Ok(out)
    }

    /// Returns whether the request existed.
    pub fn ack_pending(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn
            .execute("DELETE FROM pending_requests WHERE id=?", [id])
            .map_err(storage_err)?;
        Ok(n > 0)
    }
}

fn map_card_row(row: &rusqlite::Row<'_>) -> Result<Card> {
    let kind_s: String = row.get(2).map_err(storage_err)?;
    let payload_s: String = row.get(3).map_err(storage_err)?;
    let position_s: String = row.get(7).map_err(storage_err)?;
    Ok(Card {
        id: row.get(0).map_err(storage_err)?,
        run: row.get(1).map_err(storage_err)?,
        kind: CardKind::from_str(&kind_s)?,
        payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::Value::Null),
        title: row.get(4).map_err(storage_err)?,
        description: row.get(5).map_err(storage_err)?,
        source: row.get(6).map_err(storage_err)?,
        position: Position::from_str(&position_s)?,
        created: row.get(8).map_err(storage_err)?,
        interactive: row.get::<_, i64>(9).map_err(storage_err)? != 0,
        on_send: row.get(10).map_err(storage_err)?,
    })
}
