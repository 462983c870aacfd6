use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    history::{Event, SampleType},
    properties::PropertyValue,
    Error, Result,
};

/// Settings for [`HistoryStore`].
#[derive(Debug, Clone)]
pub struct HistoryStoreConfig {
    /// Minimum time between two recorded [`SampleType::OnUse`] samples of the same property.
    pub min_sample_interval: Duration,
}

impl HistoryStoreConfig {
    /// Default for [`HistoryStoreConfig::min_sample_interval`].
    pub const DEFAULT_MIN_SAMPLE_INTERVAL: Duration = Duration::from_secs(5 * 60);

    /// Database file created inside the data directory.
    pub const DATABASE_FILE_NAME: &'static str = "critical_moments_db.db";
}

impl Default for HistoryStoreConfig {
    fn default() -> Self {
        Self {
            min_sample_interval: Self::DEFAULT_MIN_SAMPLE_INTERVAL,
        }
    }
}

const STABLE_RANDOM_NAME: &str = "stable_random";

// Incremental and non-destructive, so they run on every start.
const MIGRATIONS: &str = "
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        type INTEGER NOT NULL,
        created_at DATETIME,
        updated_at DATETIME
    );

    CREATE INDEX IF NOT EXISTS events_name_created_at ON events (name, created_at);

    CREATE TRIGGER IF NOT EXISTS insert_events_created_at
    AFTER INSERT ON events
    BEGIN
        UPDATE events SET created_at = unixepoch('subsec') WHERE id = NEW.id;
    END;

    CREATE TRIGGER IF NOT EXISTS update_events_updated_at
    AFTER UPDATE ON events
    BEGIN
        UPDATE events SET updated_at = unixepoch('subsec') WHERE id = NEW.id;
    END;

    CREATE TABLE IF NOT EXISTS property_history (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        type INTEGER NOT NULL,
        int_value INTEGER,
        text_value TEXT,
        real_value REAL,
        numeric_value NUMERIC,
        sample_type INTEGER NOT NULL,
        created_at DATETIME,
        updated_at DATETIME
    );

    CREATE INDEX IF NOT EXISTS property_history_name_created_at
        ON property_history (name, created_at);

    CREATE TRIGGER IF NOT EXISTS insert_property_history_created_at
    AFTER INSERT ON property_history
    BEGIN
        UPDATE property_history SET created_at = unixepoch('subsec') WHERE id = NEW.id;
    END;

    CREATE TRIGGER IF NOT EXISTS update_property_history_updated_at
    AFTER UPDATE ON property_history
    BEGIN
        UPDATE property_history SET updated_at = unixepoch('subsec') WHERE id = NEW.id;
    END;
";

/// Type code stored in `property_history.type`, the column holding the value, and the value
/// converted for that column.
fn column_for(value: &PropertyValue) -> (i64, &'static str, rusqlite::types::Value) {
    use rusqlite::types::Value as Sql;
    match value {
        PropertyValue::String(s) => (1, "text_value", Sql::Text(s.clone())),
        PropertyValue::Int(i) => (2, "int_value", Sql::Integer(*i)),
        PropertyValue::Float(f) => (3, "real_value", Sql::Real(*f)),
        PropertyValue::Bool(b) => (4, "numeric_value", Sql::Integer(i64::from(*b))),
        // Times are stored as microseconds.
        PropertyValue::Timestamp(t) => (5, "int_value", Sql::Integer(t.timestamp_micros())),
    }
}

fn timestamp(seconds: f64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros((seconds * 1_000_000.0).round() as i64).unwrap_or_default()
}

enum State {
    /// Property samples set before the store opens, last write wins per name.
    Pending(HashMap<String, (PropertyValue, SampleType)>),
    Open { connection: Connection, path: PathBuf },
}

/// SQLite-backed log of events and property samples.
///
/// A single connection in WAL mode is shared behind a mutex, so the store can be used from
/// several threads. Property samples recorded before [`HistoryStore::start`] are buffered and
/// written when the store opens; events recorded before then fail with
/// [`Error::StoreNotStarted`].
pub struct HistoryStore {
    config: HistoryStoreConfig,
    state: Mutex<State>,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("config", &self.config)
            .field("started", &self.is_started())
            .finish()
    }
}

impl HistoryStore {
    /// Create a store. Nothing touches disk until [`HistoryStore::start`].
    pub fn new(config: HistoryStoreConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::Pending(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves the connection usable; SQLite rolls back
        // any unfinished statement.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open (creating if needed) the database inside `data_dir`, run migrations and flush
    /// buffered property samples. Starting an open store does nothing.
    pub fn start(&self, data_dir: &Path) -> Result<()> {
        let mut state = self.lock();
        if let State::Open { path, .. } = &*state {
            log::debug!(target: "critical_moments", path:? = path; "history store already open");
            return Ok(());
        }
        if !data_dir.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("data directory does not exist: {}", data_dir.display()),
            )
            .into());
        }

        let path = data_dir.join(HistoryStoreConfig::DATABASE_FILE_NAME);
        let connection = Connection::open(&path)?;
        connection.pragma_update(None, "journal_mode", "WAL")?;
        connection.execute_batch(MIGRATIONS)?;
        log::debug!(target: "critical_moments", path:? = path; "opened history store");

        let pending = match std::mem::replace(&mut *state, State::Open { connection, path }) {
            State::Pending(pending) => pending,
            State::Open { .. } => HashMap::new(),
        };
        if let State::Open { connection, .. } = &*state {
            for (name, (value, sample_type)) in pending {
                if let Err(err) = self.write_sample(connection, &name, &value, sample_type) {
                    log::warn!(target: "critical_moments", property = name.as_str();
                        "failed to write buffered property sample: {err}");
                }
            }
        }
        Ok(())
    }

    /// Whether [`HistoryStore::start`] succeeded.
    pub fn is_started(&self) -> bool {
        matches!(*self.lock(), State::Open { .. })
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        match &*self.lock() {
            State::Open { connection, .. } => f(connection),
            State::Pending(_) => Err(Error::StoreNotStarted),
        }
    }

    /// Record an event. The store assigns its timestamp.
    pub fn insert_event(&self, event: &Event) -> Result<()> {
        self.with_connection(|connection| {
            connection.execute(
                "INSERT INTO events (name, type) VALUES (?1, ?2)",
                params![event.name(), event.classification().code()],
            )?;
            Ok(())
        })
    }

    /// Record a property value.
    ///
    /// [`SampleType::OnUse`] samples are dropped when the latest sample of the same name is
    /// newer than the configured minimum interval. [`SampleType::DoNotSample`] values are
    /// never written. Before the store is started samples are buffered, keeping the last value
    /// per name.
    pub fn insert_property_sample(
        &self,
        name: &str,
        value: &PropertyValue,
        sample_type: SampleType,
    ) -> Result<()> {
        if name.is_empty() || sample_type == SampleType::DoNotSample {
            return Ok(());
        }
        let mut state = self.lock();
        match &mut *state {
            State::Pending(pending) => {
                pending.insert(name.to_owned(), (value.clone(), sample_type));
                Ok(())
            }
            State::Open { connection, .. } => {
                self.write_sample(connection, name, value, sample_type)
            }
        }
    }

    fn write_sample(
        &self,
        connection: &Connection,
        name: &str,
        value: &PropertyValue,
        sample_type: SampleType,
    ) -> Result<()> {
        if sample_type == SampleType::OnUse {
            let recent: bool = connection.query_row(
                "SELECT EXISTS (SELECT 1 FROM property_history
                    WHERE name = ?1 AND created_at > unixepoch('subsec') - ?2)",
                params![name, self.config.min_sample_interval.as_secs_f64()],
                |row| row.get(0),
            )?;
            if recent {
                log::trace!(target: "critical_moments", property = name; "skipping rate limited sample");
                return Ok(());
            }
        }

        let (type_code, column, sql_value) = column_for(value);
        connection.execute(
            &format!(
                "INSERT INTO property_history (name, type, {column}, sample_type) VALUES (?1, ?2, ?3, ?4)"
            ),
            params![name, type_code, sql_value, sample_type.code()],
        )?;
        Ok(())
    }

    /// Number of times `name` was recorded.
    pub fn event_count(&self, name: &str) -> Result<i64> {
        self.with_connection(|connection| {
            Ok(connection.query_row(
                "SELECT COUNT(*) FROM events WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?)
        })
    }

    /// Number of times `name` was recorded, counting at most `limit`.
    pub fn event_count_with_limit(&self, name: &str, limit: i64) -> Result<i64> {
        self.with_connection(|connection| {
            Ok(connection.query_row(
                "SELECT COUNT(*) FROM (SELECT id FROM events WHERE name = ?1 LIMIT ?2)",
                params![name, limit],
                |row| row.get(0),
            )?)
        })
    }

    fn event_time(&self, name: &str, order: &str) -> Result<Option<DateTime<Utc>>> {
        self.with_connection(|connection| {
            let seconds: Option<f64> = connection
                .query_row(
                    &format!(
                        "SELECT created_at FROM events WHERE name = ?1
                         ORDER BY created_at {order}, id {order} LIMIT 1"
                    ),
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(seconds.map(timestamp))
        })
    }

    /// Time `name` was most recently recorded.
    pub fn latest_event_time(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        self.event_time(name, "DESC")
    }

    /// Time `name` was first recorded.
    pub fn first_event_time(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        self.event_time(name, "ASC")
    }

    /// Every time `name` was recorded, oldest first.
    pub fn all_event_times(&self, name: &str) -> Result<Vec<DateTime<Utc>>> {
        self.with_connection(|connection| {
            let mut statement = connection.prepare_cached(
                "SELECT created_at FROM events WHERE name = ?1 ORDER BY created_at ASC, id ASC",
            )?;
            let times = statement
                .query_map(params![name], |row| row.get::<_, f64>(0))?
                .map(|seconds| seconds.map(timestamp))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(times)
        })
    }

    /// Most recently recorded value of property `name`.
    pub fn latest_property_value(&self, name: &str) -> Result<Option<PropertyValue>> {
        self.with_connection(|connection| {
            let row = connection
                .query_row(
                    "SELECT type, text_value, int_value, real_value, numeric_value
                     FROM property_history WHERE name = ?1
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    params![name],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                            row.get::<_, Option<f64>>(3)?,
                            row.get::<_, Option<bool>>(4)?,
                        ))
                    },
                )
                .optional()?;

            let Some((type_code, text, int, real, boolean)) = row else {
                return Ok(None);
            };
            Ok(match type_code {
                1 => text.map(PropertyValue::String),
                2 => int.map(PropertyValue::Int),
                3 => real.map(PropertyValue::Float),
                4 => boolean.map(PropertyValue::Bool),
                5 => int
                    .and_then(DateTime::from_timestamp_micros)
                    .map(PropertyValue::Timestamp),
                other => {
                    log::warn!(target: "critical_moments", property = name, type_code = other;
                        "unknown property type in history");
                    None
                }
            })
        })
    }

    /// Whether property `name` was ever recorded with exactly `value`.
    pub fn property_ever_had_value(&self, name: &str, value: &PropertyValue) -> Result<bool> {
        let (type_code, column, sql_value) = column_for(value);
        self.with_connection(|connection| {
            Ok(connection.query_row(
                &format!(
                    "SELECT EXISTS (SELECT 1 FROM property_history
                        WHERE name = ?1 AND type = ?2 AND {column} = ?3)"
                ),
                params![name, type_code, sql_value],
                |row| row.get(0),
            )?)
        })
    }

    /// Random value generated once per install and kept for the life of the database.
    pub fn stable_random(&self) -> Result<i64> {
        let candidate = rand::thread_rng().gen_range(0..=i64::MAX);
        self.with_connection(|connection| {
            let inserted = connection.execute(
                "INSERT INTO property_history (name, type, int_value, sample_type)
                 SELECT ?1, ?2, ?3, ?4
                 WHERE NOT EXISTS (SELECT 1 FROM property_history WHERE name = ?1 LIMIT 1)",
                params![
                    STABLE_RANDOM_NAME,
                    2,
                    candidate,
                    SampleType::DoNotSample.code()
                ],
            )?;
            if inserted == 1 {
                return Ok(candidate);
            }
            Ok(connection.query_row(
                "SELECT int_value FROM property_history WHERE name = ?1
                 ORDER BY created_at ASC, id ASC LIMIT 1",
                params![STABLE_RANDOM_NAME],
                |row| row.get(0),
            )?)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    use super::{HistoryStore, HistoryStoreConfig};
    use crate::{
        history::{built_in, Event, SampleType},
        properties::PropertyValue,
        Error,
    };

    fn open_store(min_sample_interval: Duration) -> (TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(HistoryStoreConfig {
            min_sample_interval,
        });
        store.start(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn counts_events() {
        let (_dir, store) = open_store(HistoryStoreConfig::DEFAULT_MIN_SAMPLE_INTERVAL);
        let event = Event::custom("checkout").unwrap();
        for _ in 0..3 {
            store.insert_event(&event).unwrap();
        }
        store
            .insert_event(&Event::built_in(built_in::APP_START).unwrap())
            .unwrap();

        assert_eq!(store.event_count("checkout").unwrap(), 3);
        assert_eq!(store.event_count_with_limit("checkout", 2).unwrap(), 2);
        assert_eq!(store.event_count_with_limit("checkout", 10).unwrap(), 3);
        assert_eq!(store.event_count("missing").unwrap(), 0);
        assert_eq!(store.event_count(built_in::APP_START).unwrap(), 1);
    }

    #[test]
    fn event_times_are_ordered() {
        let (_dir, store) = open_store(HistoryStoreConfig::DEFAULT_MIN_SAMPLE_INTERVAL);
        assert_eq!(store.latest_event_time("tap").unwrap(), None);
        assert_eq!(store.first_event_time("tap").unwrap(), None);

        let before = Utc::now() - chrono::Duration::seconds(1);
        let event = Event::custom("tap").unwrap();
        store.insert_event(&event).unwrap();
        thread::sleep(Duration::from_millis(20));
        store.insert_event(&event).unwrap();

        let all = store.all_event_times("tap").unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0] < all[1]);
        assert!(all[0] > before);
        assert_eq!(store.first_event_time("tap").unwrap(), Some(all[0]));
        assert_eq!(store.latest_event_time("tap").unwrap(), Some(all[1]));
    }

    #[test]
    fn events_require_a_started_store() {
        let store = HistoryStore::new(HistoryStoreConfig::default());
        assert!(matches!(
            store.insert_event(&Event::custom("a").unwrap()),
            Err(Error::StoreNotStarted)
        ));
        assert!(matches!(store.event_count("a"), Err(Error::StoreNotStarted)));
    }

    #[test]
    fn start_requires_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(HistoryStoreConfig::default());
        assert!(matches!(
            store.start(&dir.path().join("missing")),
            Err(Error::Io(_))
        ));
        assert!(!store.is_started());
    }

    #[test]
    fn stores_every_property_kind() {
        let (_dir, store) = open_store(HistoryStoreConfig::DEFAULT_MIN_SAMPLE_INTERVAL);
        let signup = DateTime::from_timestamp_micros(1_700_000_000_123_456).unwrap();
        let values = [
            ("s", PropertyValue::from("hello")),
            ("i", PropertyValue::Int(-4)),
            ("f", PropertyValue::Float(2.5)),
            ("b", PropertyValue::Bool(true)),
            ("t", PropertyValue::Timestamp(signup)),
        ];
        for (name, value) in &values {
            store
                .insert_property_sample(name, value, SampleType::AppStart)
                .unwrap();
        }
        for (name, value) in &values {
            assert_eq!(store.latest_property_value(name).unwrap().as_ref(), Some(value));
            assert!(store.property_ever_had_value(name, value).unwrap());
        }

        assert_eq!(store.latest_property_value("missing").unwrap(), None);
        assert!(!store
            .property_ever_had_value("b", &PropertyValue::Bool(false))
            .unwrap());
        // Same column, different type.
        assert!(!store
            .property_ever_had_value("t", &PropertyValue::Int(signup.timestamp_micros()))
            .unwrap());
    }

    #[test]
    fn rate_limits_on_use_samples() {
        let (_dir, store) = open_store(Duration::from_millis(300));
        let sample = |value: &str| {
            store
                .insert_property_sample("os_version", &PropertyValue::from(value), SampleType::OnUse)
                .unwrap()
        };

        sample("a");
        sample("b");
        assert_eq!(
            store.latest_property_value("os_version").unwrap(),
            Some(PropertyValue::from("a"))
        );
        assert!(!store
            .property_ever_had_value("os_version", &PropertyValue::from("b"))
            .unwrap());

        thread::sleep(Duration::from_millis(400));
        sample("c");
        assert_eq!(
            store.latest_property_value("os_version").unwrap(),
            Some(PropertyValue::from("c"))
        );
    }

    #[test]
    fn app_start_and_custom_samples_bypass_rate_limit() {
        let (_dir, store) = open_store(HistoryStoreConfig::DEFAULT_MIN_SAMPLE_INTERVAL);
        for (value, sample_type) in [
            (1, SampleType::AppStart),
            (2, SampleType::OnCustomSet),
            (3, SampleType::OnUse),
            (4, SampleType::DoNotSample),
        ] {
            store
                .insert_property_sample("custom_seats", &PropertyValue::Int(value), sample_type)
                .unwrap();
        }
        assert_eq!(
            store.latest_property_value("custom_seats").unwrap(),
            Some(PropertyValue::Int(2))
        );
    }

    #[test]
    fn buffers_samples_until_started() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(HistoryStoreConfig::default());
        store
            .insert_property_sample("custom_plan", &PropertyValue::from("free"), SampleType::OnCustomSet)
            .unwrap();
        store
            .insert_property_sample("custom_plan", &PropertyValue::from("pro"), SampleType::OnCustomSet)
            .unwrap();
        store.start(dir.path()).unwrap();

        assert_eq!(
            store.latest_property_value("custom_plan").unwrap(),
            Some(PropertyValue::from("pro"))
        );
        assert!(!store
            .property_ever_had_value("custom_plan", &PropertyValue::from("free"))
            .unwrap());
    }

    #[test]
    fn stable_random_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let store = HistoryStore::new(HistoryStoreConfig::default());
            store.start(dir.path()).unwrap();
            let value = store.stable_random().unwrap();
            assert_eq!(store.stable_random().unwrap(), value);
            value
        };

        let store = HistoryStore::new(HistoryStoreConfig::default());
        store.start(dir.path()).unwrap();
        assert_eq!(store.stable_random().unwrap(), first);
    }
}
