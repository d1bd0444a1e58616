use std::collections::HashMap;
use std::str::FromStr;

use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::config::AppConfig;
use crate::models::{
    Chunk, FindingLevel, Scene, SupportRow, Trope, TropeCandidate, TropeFinding, TropeSanity, Work,
};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        Self::connect(&config.sqlite_dsn()).await
    }

    pub async fn connect(dsn: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS work (
                id         TEXT PRIMARY KEY,
                title      TEXT,
                author     TEXT,
                source     TEXT,
                license    TEXT,
                raw_text   BLOB,
                norm_text  TEXT,
                char_count INTEGER,
                created_at TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );

            CREATE TABLE IF NOT EXISTS scene (
                id         TEXT PRIMARY KEY,
                work_id    TEXT    NOT NULL,
                chapter_id TEXT,
                idx        INTEGER NOT NULL,
                char_start INTEGER,
                char_end   INTEGER,
                heading    TEXT,
                FOREIGN KEY(work_id) REFERENCES work(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_scene_work_idx ON scene(work_id, idx);

            CREATE TABLE IF NOT EXISTS chunk (
                id          TEXT PRIMARY KEY,
                work_id     TEXT    NOT NULL,
                scene_id    TEXT,
                idx         INTEGER NOT NULL,
                char_start  INTEGER,
                char_end    INTEGER,
                text        TEXT    NOT NULL,
                sha256      TEXT,
                FOREIGN KEY(work_id)  REFERENCES work(id)  ON DELETE CASCADE,
                FOREIGN KEY(scene_id) REFERENCES scene(id) ON DELETE SET NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chunk_work_idx   ON chunk(work_id, idx);
            CREATE INDEX IF NOT EXISTS idx_chunk_work_scene ON chunk(work_id, scene_id, idx);
            CREATE INDEX IF NOT EXISTS idx_chunk_work_span  ON chunk(work_id, char_start, char_end);

            CREATE TABLE IF NOT EXISTS embedding_ref (
                chunk_id   TEXT    NOT NULL,
                collection TEXT    NOT NULL,
                model      TEXT    NOT NULL,
                dim        INTEGER NOT NULL,
                point_id   TEXT    NOT NULL,
                PRIMARY KEY (chunk_id, collection),
                FOREIGN KEY (chunk_id) REFERENCES chunk(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS trope (
                id           TEXT PRIMARY KEY,
                name         TEXT NOT NULL UNIQUE,
                summary      TEXT,
                aliases      TEXT,
                anti_aliases TEXT,
                source_url   TEXT,
                grp          TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_trope_name ON trope(name);

            CREATE TABLE IF NOT EXISTS trope_candidate (
                id       TEXT PRIMARY KEY,
                work_id  TEXT NOT NULL,
                scene_id TEXT NOT NULL,
                chunk_id TEXT,
                trope_id TEXT NOT NULL,
                surface  TEXT,
                alias    TEXT,
                start    INTEGER NOT NULL,
                end      INTEGER NOT NULL,
                source   TEXT NOT NULL,
                score    REAL NOT NULL DEFAULT 0.0,
                created_at TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                FOREIGN KEY(work_id)  REFERENCES work(id)  ON DELETE CASCADE,
                FOREIGN KEY(trope_id) REFERENCES trope(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_tc_work_scene ON trope_candidate(work_id, scene_id);
            CREATE INDEX IF NOT EXISTS idx_tc_trope ON trope_candidate(trope_id);
            CREATE UNIQUE INDEX IF NOT EXISTS uq_candidate_span
                ON trope_candidate(work_id, trope_id, start, end);

            CREATE TABLE IF NOT EXISTS support_selection (
                scene_id     TEXT NOT NULL,
                chunk_id     TEXT NOT NULL,
                rank         INTEGER NOT NULL,
                stage1_score REAL,
                stage2_score REAL,
                picked       INTEGER NOT NULL DEFAULT 1,
                created_at   TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                PRIMARY KEY (scene_id, chunk_id)
            );

            CREATE TABLE IF NOT EXISTS trope_sanity (
                scene_id   TEXT NOT NULL,
                trope_id   TEXT NOT NULL,
                lex_ok     INTEGER NOT NULL,
                sem_sim    REAL    NOT NULL,
                weight     REAL    NOT NULL,
                created_at TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                PRIMARY KEY (scene_id, trope_id)
            );

            CREATE TABLE IF NOT EXISTS trope_finding (
                id                  TEXT PRIMARY KEY,
                work_id             TEXT NOT NULL,
                scene_id            TEXT NOT NULL,
                chunk_id            TEXT,
                trope_id            TEXT NOT NULL,
                level               TEXT NOT NULL DEFAULT 'span',
                confidence          REAL NOT NULL,
                rationale           TEXT,
                evidence_start      INTEGER NOT NULL,
                evidence_end        INTEGER NOT NULL,
                model               TEXT,
                verifier_score      REAL,
                verifier_flag       TEXT,
                calibration_version TEXT,
                threshold_used      REAL,
                run_id              TEXT,
                created_at          TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                FOREIGN KEY(work_id)  REFERENCES work(id)  ON DELETE CASCADE,
                FOREIGN KEY(trope_id) REFERENCES trope(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_tf_work_scene ON trope_finding(work_id, scene_id);
            CREATE INDEX IF NOT EXISTS idx_tf_trope ON trope_finding(trope_id);
            CREATE UNIQUE INDEX IF NOT EXISTS uq_finding_span
                ON trope_finding(work_id, trope_id, evidence_start, evidence_end);

            CREATE TABLE IF NOT EXISTS run (
                id          TEXT PRIMARY KEY,
                created_at  TEXT NOT NULL,
                params_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id         TEXT PRIMARY KEY,
                run_id     TEXT,
                work_id    TEXT,
                scene_id   TEXT,
                kind       TEXT NOT NULL,
                detail     TEXT,
                created_at TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_audit_run ON audit_log(run_id);

            CREATE TABLE IF NOT EXISTS trope_thresholds (
                trope_id   TEXT PRIMARY KEY,
                threshold  REAL NOT NULL,
                samples    INTEGER,
                pos        INTEGER,
                neg        INTEGER,
                objective  TEXT,
                updated_at TEXT
            );

            CREATE TABLE IF NOT EXISTS trope_finding_human (
                id                 TEXT PRIMARY KEY,
                finding_id         TEXT NOT NULL,
                decision           TEXT NOT NULL CHECK(decision IN ('accept','reject','edit')),
                corrected_start    INTEGER,
                corrected_end      INTEGER,
                corrected_trope_id TEXT,
                note               TEXT,
                reviewer           TEXT,
                created_at         TEXT DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
                FOREIGN KEY(finding_id) REFERENCES trope_finding(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_tfh_finding ON trope_finding_human(finding_id);

            CREATE VIEW IF NOT EXISTS v_latest_human AS
            SELECT h.*
            FROM trope_finding_human h
            JOIN (
                SELECT finding_id, MAX(created_at) AS mx
                FROM trope_finding_human
                GROUP BY finding_id
            ) last ON last.finding_id = h.finding_id AND last.mx = h.created_at;
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- reads ------------------------------------------------------------

    pub async fn get_work(&self, work_id: &str) -> Result<Option<Work>> {
        let row = sqlx::query(
            "SELECT id, title, author, norm_text, char_count FROM work WHERE id = ?",
        )
        .bind(work_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Work {
            id: r.get("id"),
            title: r.get("title"),
            author: r.get("author"),
            norm_text: r.get::<Option<String>, _>("norm_text").unwrap_or_default(),
            char_count: r.get::<Option<i64>, _>("char_count").unwrap_or_default(),
        }))
    }

    pub async fn scenes_for_work(&self, work_id: &str) -> Result<Vec<Scene>> {
        let rows = sqlx::query(
            "SELECT id, work_id, idx, char_start, char_end FROM scene WHERE work_id = ? ORDER BY idx ASC",
        )
        .bind(work_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Scene {
                id: r.get("id"),
                work_id: r.get("work_id"),
                idx: r.get("idx"),
                char_start: r.get::<Option<i64>, _>("char_start").unwrap_or_default(),
                char_end: r.get::<Option<i64>, _>("char_end").unwrap_or_default(),
            })
            .collect())
    }

    pub async fn chunks_for_work(&self, work_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            r#"
            SELECT id, work_id, scene_id, idx, char_start, char_end, text, sha256
            FROM chunk
            WHERE work_id = ? AND scene_id IS NOT NULL
            ORDER BY idx ASC
            "#,
        )
        .bind(work_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_chunk).collect())
    }

    pub async fn chunks_by_ids(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, work_id, scene_id, idx, char_start, char_end, text, sha256 FROM chunk WHERE id IN (",
        );
        let mut separated = qb.separated(",");
        for id in ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let rows: Vec<SqliteRow> = qb.build().fetch_all(&self.pool).await?;
        let mut chunks: Vec<Chunk> = rows.into_iter().map(row_to_chunk).collect();

        chunks.sort_by_key(|chunk| {
            ids.iter()
                .position(|id| id == &chunk.id)
                .unwrap_or(usize::MAX)
        });

        Ok(chunks)
    }

    pub async fn load_tropes(&self) -> Result<Vec<Trope>> {
        let rows = sqlx::query(
            "SELECT id, name, COALESCE(summary,'') AS summary, aliases, anti_aliases
             FROM trope ORDER BY name COLLATE NOCASE",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Trope {
                id: r.get("id"),
                name: r.get("name"),
                summary: r.get("summary"),
                aliases: parse_alias_blob(r.get::<Option<String>, _>("aliases").as_deref()),
                anti_aliases: parse_alias_blob(
                    r.get::<Option<String>, _>("anti_aliases").as_deref(),
                ),
            })
            .collect())
    }

    /// Per-trope thresholds learned from human labels; absent tropes use the
    /// global threshold.
    pub async fn trope_thresholds(&self) -> Result<HashMap<String, f32>> {
        let rows = sqlx::query("SELECT trope_id, threshold FROM trope_thresholds")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get::<String, _>("trope_id"),
                    r.get::<f64, _>("threshold") as f32,
                )
            })
            .collect())
    }

    /// Candidate tropes for one scene with the best seed score per trope.
    pub async fn scene_candidate_tropes(
        &self,
        work_id: &str,
        scene_id: &str,
    ) -> Result<Vec<(String, f32)>> {
        let rows = sqlx::query(
            r#"
            SELECT trope_id, MAX(score) AS best
            FROM trope_candidate
            WHERE work_id = ? AND scene_id = ?
            GROUP BY trope_id
            "#,
        )
        .bind(work_id)
        .bind(scene_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get::<String, _>("trope_id"),
                    r.get::<Option<f64>, _>("best").unwrap_or_default() as f32,
                )
            })
            .collect())
    }

    pub async fn findings_for_run(&self, run_id: &str) -> Result<Vec<TropeFinding>> {
        let rows = sqlx::query(
            r#"
            SELECT id, work_id, scene_id, chunk_id, trope_id, level, confidence, rationale,
                   evidence_start, evidence_end, model, verifier_score, verifier_flag,
                   calibration_version, threshold_used, run_id
            FROM trope_finding
            WHERE run_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_finding).collect())
    }

    pub async fn work_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT work_id FROM chunk ORDER BY work_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("work_id")).collect())
    }

    /// Chunks not yet stamped in `embedding_ref` for the given collection.
    pub async fn unembedded_chunks(
        &self,
        collection: &str,
        work_id: Option<&str>,
    ) -> Result<Vec<Chunk>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT c.id, c.work_id, c.scene_id, c.idx, c.char_start, c.char_end, c.text, c.sha256
             FROM chunk c LEFT JOIN embedding_ref e
               ON e.chunk_id = c.id AND e.collection = ",
        );
        qb.push_bind(collection);
        qb.push(" WHERE e.chunk_id IS NULL AND c.scene_id IS NOT NULL");
        if let Some(work_id) = work_id {
            qb.push(" AND c.work_id = ");
            qb.push_bind(work_id);
        }
        qb.push(" ORDER BY c.idx ASC");

        let rows: Vec<SqliteRow> = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(row_to_chunk).collect())
    }

    pub async fn mark_embedded(
        &self,
        collection: &str,
        model: &str,
        dim: usize,
        chunk_ids: &[String],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk_id in chunk_ids {
            sqlx::query(
                "INSERT OR REPLACE INTO embedding_ref(chunk_id, collection, model, dim, point_id)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(chunk_id)
            .bind(collection)
            .bind(model)
            .bind(dim as i64)
            .bind(chunk_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ---- writes -----------------------------------------------------------

    /// Insert one candidate; duplicates on (work, trope, start, end) are
    /// benign and reported as not-inserted.
    pub async fn insert_candidate(&self, candidate: &TropeCandidate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO trope_candidate
                (id, work_id, scene_id, chunk_id, trope_id, surface, alias, start, end, source, score)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&candidate.id)
        .bind(&candidate.work_id)
        .bind(&candidate.scene_id)
        .bind(&candidate.chunk_id)
        .bind(&candidate.trope_id)
        .bind(&candidate.surface)
        .bind(&candidate.alias)
        .bind(candidate.start)
        .bind(candidate.end)
        .bind(candidate.source.as_str())
        .bind(candidate.score as f64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All rows for one scene land in a single transaction: support and
    /// sanity first, findings last, so a finding is never visible without
    /// its supporting rows.
    pub async fn write_scene_results(
        &self,
        support: &[SupportRow],
        sanity: &[TropeSanity],
        findings: &[TropeFinding],
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;

        for row in support {
            sqlx::query(
                r#"
                INSERT INTO support_selection (scene_id, chunk_id, rank, stage1_score, stage2_score, picked)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(scene_id, chunk_id) DO UPDATE SET
                    rank = excluded.rank,
                    stage1_score = excluded.stage1_score,
                    stage2_score = excluded.stage2_score,
                    picked = excluded.picked
                "#,
            )
            .bind(&row.scene_id)
            .bind(&row.chunk_id)
            .bind(row.rank)
            .bind(row.stage1_score as f64)
            .bind(row.stage2_score as f64)
            .bind(row.picked as i64)
            .execute(&mut *tx)
            .await?;
        }

        for row in sanity {
            sqlx::query(
                r#"
                INSERT INTO trope_sanity (scene_id, trope_id, lex_ok, sem_sim, weight)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(scene_id, trope_id) DO UPDATE SET
                    lex_ok = excluded.lex_ok,
                    sem_sim = excluded.sem_sim,
                    weight = excluded.weight
                "#,
            )
            .bind(&row.scene_id)
            .bind(&row.trope_id)
            .bind(row.lex_ok as i64)
            .bind(row.sem_sim as f64)
            .bind(row.weight as f64)
            .execute(&mut *tx)
            .await?;
        }

        let mut inserted = 0usize;
        for finding in findings {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO trope_finding
                    (id, work_id, scene_id, chunk_id, trope_id, level, confidence, rationale,
                     evidence_start, evidence_end, model, verifier_score, verifier_flag,
                     calibration_version, threshold_used, run_id)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&finding.id)
            .bind(&finding.work_id)
            .bind(&finding.scene_id)
            .bind(&finding.chunk_id)
            .bind(&finding.trope_id)
            .bind(finding.level.as_str())
            .bind(finding.confidence as f64)
            .bind(&finding.rationale)
            .bind(finding.evidence_start)
            .bind(finding.evidence_end)
            .bind(&finding.model)
            .bind(finding.verifier_score.map(|v| v as f64))
            .bind(&finding.verifier_flag)
            .bind(&finding.calibration_version)
            .bind(finding.threshold_used as f64)
            .bind(&finding.run_id)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn insert_run(&self, run_id: &str, params_json: &str) -> Result<()> {
        sqlx::query("INSERT INTO run (id, created_at, params_json) VALUES (?, ?, ?)")
            .bind(run_id)
            .bind(Utc::now().to_rfc3339())
            .bind(params_json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_audit(
        &self,
        run_id: &str,
        work_id: &str,
        scene_id: Option<&str>,
        kind: &str,
        detail: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (id, run_id, work_id, scene_id, kind, detail) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(run_id)
        .bind(work_id)
        .bind(scene_id)
        .bind(kind)
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_finding_span(
        &self,
        finding_id: &str,
        start: i64,
        end: i64,
        verifier_score: f32,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE trope_finding SET evidence_start = ?, evidence_end = ?, verifier_score = ? WHERE id = ?",
        )
        .bind(start)
        .bind(end)
        .bind(verifier_score as f64)
        .bind(finding_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_verifier_score(&self, finding_id: &str, verifier_score: f32) -> Result<()> {
        sqlx::query("UPDATE trope_finding SET verifier_score = ? WHERE id = ?")
            .bind(verifier_score as f64)
            .bind(finding_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_verifier_flag(&self, finding_id: &str, flag: &str) -> Result<()> {
        sqlx::query("UPDATE trope_finding SET verifier_flag = ? WHERE id = ?")
            .bind(flag)
            .bind(finding_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn downweight_finding(
        &self,
        finding_id: &str,
        confidence: f32,
        flag: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE trope_finding SET confidence = ?, verifier_flag = ? WHERE id = ?")
            .bind(confidence as f64)
            .bind(flag)
            .bind(finding_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_finding(&self, finding_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM trope_finding WHERE id = ?")
            .bind(finding_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Aliases are stored as a JSON array; very old catalogs used a
/// pipe-delimited string, which still parses.
fn parse_alias_blob(blob: Option<&str>) -> Vec<String> {
    let Some(blob) = blob else {
        return vec![];
    };
    let trimmed = blob.trim();
    if trimmed.is_empty() {
        return vec![];
    }
    if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(trimmed) {
        return items
            .into_iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect();
    }
    if trimmed.contains('|') {
        return trimmed
            .split('|')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    vec![]
}

fn row_to_chunk(row: SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        work_id: row.get("work_id"),
        scene_id: row.get::<Option<String>, _>("scene_id").unwrap_or_default(),
        idx: row.get("idx"),
        char_start: row.get::<Option<i64>, _>("char_start").unwrap_or_default(),
        char_end: row.get::<Option<i64>, _>("char_end").unwrap_or_default(),
        text: row.get("text"),
        sha256: row.get::<Option<String>, _>("sha256").unwrap_or_default(),
    }
}

fn row_to_finding(row: SqliteRow) -> TropeFinding {
    TropeFinding {
        id: row.get("id"),
        work_id: row.get("work_id"),
        scene_id: row.get("scene_id"),
        chunk_id: row.get("chunk_id"),
        trope_id: row.get("trope_id"),
        level: FindingLevel::from_db(&row.get::<String, _>("level")),
        confidence: row.get::<f64, _>("confidence") as f32,
        rationale: row.get::<Option<String>, _>("rationale").unwrap_or_default(),
        evidence_start: row.get("evidence_start"),
        evidence_end: row.get("evidence_end"),
        model: row.get::<Option<String>, _>("model").unwrap_or_default(),
        verifier_score: row.get::<Option<f64>, _>("verifier_score").map(|v| v as f32),
        verifier_flag: row.get("verifier_flag"),
        calibration_version: row.get("calibration_version"),
        threshold_used: row.get::<Option<f64>, _>("threshold_used").unwrap_or_default() as f32,
        run_id: row.get::<Option<String>, _>("run_id").unwrap_or_default(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::CandidateSource;
    use crate::text_index::sha256_hex;

    pub(crate) async fn memory_db() -> Database {
        Database::connect("sqlite::memory:").await.unwrap()
    }

    pub(crate) async fn seed_minimal_work(db: &Database) {
        sqlx::query("INSERT INTO work (id, title, norm_text, char_count) VALUES (?, ?, ?, ?)")
            .bind("w1")
            .bind("Test Work")
            .bind("It was a dark and stormy night. The detective arrived late.")
            .bind(59_i64)
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO scene (id, work_id, idx, char_start, char_end) VALUES (?, ?, ?, ?, ?)",
        )
        .bind("s1")
        .bind("w1")
        .bind(0_i64)
        .bind(0_i64)
        .bind(59_i64)
        .execute(db.pool())
        .await
        .unwrap();
        let text = "It was a dark and stormy night.";
        sqlx::query(
            "INSERT INTO chunk (id, work_id, scene_id, idx, char_start, char_end, text, sha256)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind("c1")
        .bind("w1")
        .bind("s1")
        .bind(0_i64)
        .bind(0_i64)
        .bind(31_i64)
        .bind(text)
        .bind(sha256_hex(text))
        .execute(db.pool())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO trope (id, name, summary, aliases, anti_aliases) VALUES (?, ?, ?, ?, ?)",
        )
        .bind("t1")
        .bind("Dark And Stormy Night")
        .bind("An ominous weather opening.")
        .bind(r#"["dark and stormy"]"#)
        .bind("[]")
        .execute(db.pool())
        .await
        .unwrap();
    }

    fn finding(id: &str, start: i64, end: i64) -> TropeFinding {
        TropeFinding {
            id: id.to_string(),
            work_id: "w1".into(),
            scene_id: "s1".into(),
            chunk_id: None,
            trope_id: "t1".into(),
            level: crate::models::FindingLevel::Span,
            confidence: 0.8,
            rationale: "storm opening".into(),
            evidence_start: start,
            evidence_end: end,
            model: "llama3.1:8b".into(),
            verifier_score: None,
            verifier_flag: None,
            calibration_version: None,
            threshold_used: 0.25,
            run_id: "r1".into(),
        }
    }

    #[tokio::test]
    async fn candidate_insert_is_idempotent() {
        let db = memory_db().await;
        seed_minimal_work(&db).await;

        let candidate = TropeCandidate {
            id: "cand1".into(),
            work_id: "w1".into(),
            scene_id: "s1".into(),
            chunk_id: Some("c1".into()),
            trope_id: "t1".into(),
            surface: Some("dark and stormy".into()),
            alias: Some("dark and stormy".into()),
            start: 9,
            end: 24,
            source: CandidateSource::Gazetteer,
            score: 0.0,
        };
        assert!(db.insert_candidate(&candidate).await.unwrap());

        let duplicate = TropeCandidate {
            id: "cand2".into(),
            ..candidate.clone()
        };
        assert!(!db.insert_candidate(&duplicate).await.unwrap());
    }

    #[tokio::test]
    async fn scene_results_commit_together_and_dedup_findings() {
        let db = memory_db().await;
        seed_minimal_work(&db).await;
        db.insert_run("r1", "{}").await.unwrap();

        let support = vec![SupportRow {
            scene_id: "s1".into(),
            chunk_id: "c1".into(),
            rank: 1,
            stage1_score: 0.9,
            stage2_score: 1.0,
            picked: true,
        }];
        let sanity = vec![TropeSanity {
            scene_id: "s1".into(),
            trope_id: "t1".into(),
            lex_ok: true,
            sem_sim: 0.5,
            weight: 1.0,
        }];
        let findings = vec![finding("f1", 0, 31)];

        let inserted = db
            .write_scene_results(&support, &sanity, &findings)
            .await
            .unwrap();
        assert_eq!(inserted, 1);

        // Same span again under a different id: the unique index absorbs it.
        let inserted = db
            .write_scene_results(&support, &sanity, &[finding("f2", 0, 31)])
            .await
            .unwrap();
        assert_eq!(inserted, 0);

        let found = db.findings_for_run("r1").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "f1");
        assert_eq!(found[0].threshold_used, 0.25);
    }

    #[tokio::test]
    async fn alias_blob_parsing_handles_json_and_legacy() {
        assert_eq!(
            parse_alias_blob(Some(r#"["a","b"]"#)),
            vec!["a".to_string(), "b".to_string()]
        );
        assert_eq!(
            parse_alias_blob(Some("one | two")),
            vec!["one".to_string(), "two".to_string()]
        );
        assert!(parse_alias_blob(Some("")).is_empty());
        assert!(parse_alias_blob(None).is_empty());
    }

    #[tokio::test]
    async fn latest_human_view_returns_newest_decision() {
        let db = memory_db().await;
        seed_minimal_work(&db).await;
        db.insert_run("r1", "{}").await.unwrap();
        db.write_scene_results(&[], &[], &[finding("f1", 0, 31)])
            .await
            .unwrap();

        for (id, decision, ts) in [
            ("h1", "reject", "2026-01-01T00:00:00.000Z"),
            ("h2", "accept", "2026-01-02T00:00:00.000Z"),
        ] {
            sqlx::query(
                "INSERT INTO trope_finding_human (id, finding_id, decision, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind("f1")
            .bind(decision)
            .bind(ts)
            .execute(db.pool())
            .await
            .unwrap();
        }

        let row = sqlx::query("SELECT decision FROM v_latest_human WHERE finding_id = 'f1'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("decision"), "accept");
    }
}
