#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::TryStreamExt;
use log::{debug, info, warn};
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, Column, Connection, Row};

use crate::utils::config::Config;
use crate::utils::errors::{Errors, QueryError};

// ***************************************************************************
//                                Constants
// ***************************************************************************
/// The only statement ever issued.  No caller input reaches it.
pub const FIXED_QUERY: &str = "SELECT * FROM MyTest;";

const NAME_COLUMN: &str = "Name";
const AGE_COLUMN : &str = "Age";

// ***************************************************************************
//                               Result Types
// ***************************************************************************
/// The two columns read from the first MyTest row.  NULL columns are
/// formatted as empty text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MyTestRow {
    pub name: Option<String>,
    pub age: Option<i64>,
}

impl fmt::Display for MyTestRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, ", self.name.as_deref().unwrap_or(""))?;
        match self.age {
            Some(age) => write!(f, "{}", age),
            None => Ok(()),
        }
    }
}

impl MyTestRow {
    pub fn new(name: &str, age: i64) -> Self {
        Self { name: Some(name.to_string()), age: Some(age) }
    }

    fn from_row(row: &AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            name: row.try_get(column_index(row, NAME_COLUMN)?)?,
            age: row.try_get(column_index(row, AGE_COLUMN)?)?,
        })
    }
}

// ---------------------------------------------------------------------------
// column_index:
// ---------------------------------------------------------------------------
/** Column names are matched without regard to ASCII case.  Postgres folds
 * unquoted identifiers to lower case, so "Name" comes back as "name".
 */
fn column_index(row: &AnyRow, name: &str) -> Result<usize, sqlx::Error> {
    row.columns()
        .iter()
        .position(|c| c.name().eq_ignore_ascii_case(name))
        .ok_or_else(|| sqlx::Error::ColumnNotFound(name.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    Row(MyTestRow),
    Empty,
}

// ***************************************************************************
//                             Connection Tally
// ***************************************************************************
/// Counts connections opened and released by one handler instance.  After
/// every request completes the two counts are equal.
#[derive(Debug, Default)]
pub struct ConnectionTally {
    opened: AtomicU64,
    released: AtomicU64,
}

impl ConnectionTally {
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    /// Connections currently held by in-flight requests.
    pub fn outstanding(&self) -> u64 {
        self.opened().saturating_sub(self.released())
    }
}

// ***************************************************************************
//                               FixedQuery
// ***************************************************************************
/// Runs [`FIXED_QUERY`] against the database named by a connection key.
///
/// Every call opens its own connection and closes it before returning, no
/// matter how the read ends.
#[derive(Debug, Clone)]
pub struct FixedQuery {
    key: String,
    url: String,
    tally: Arc<ConnectionTally>,
}

impl FixedQuery {
    // ---------------------------------------------------------------------------
    // new:
    // ---------------------------------------------------------------------------
    /** Resolve the connection key now so a missing connection string is a
     * startup failure rather than a request failure.
     */
    pub fn new(key: &str, config: &Config) -> Result<Self, Errors> {
        let url = config.connection_string(key)?.expose().to_string();
        sqlx::any::install_default_drivers();
        Ok(Self { key: key.to_string(), url, tally: Arc::new(ConnectionTally::default()) })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn tally(&self) -> &ConnectionTally {
        &self.tally
    }

    // ---------------------------------------------------------------------------
    // run:
    // ---------------------------------------------------------------------------
    pub async fn run(&self) -> Result<QueryOutcome, QueryError> {
        info!("Opening connection '{}'.", self.key);
        let mut conn = AnyConnection::connect(&self.url)
            .await
            .map_err(|source| QueryError::Connect { key: self.key.clone(), source })?;
        self.tally.opened.fetch_add(1, Ordering::SeqCst);

        let result = self.read_first_row(&mut conn).await;

        // The row stream is gone by now; close the connection on every path.
        if let Err(e) = conn.close().await {
            warn!("Closing connection '{}' failed: {}", self.key, e);
        }
        self.tally.released.fetch_add(1, Ordering::SeqCst);
        debug!("Connection '{}' released, {} outstanding.", self.key, self.tally.outstanding());

        match &result {
            Ok(QueryOutcome::Row(row)) => debug!("Read from '{}': {}", self.key, row),
            Ok(QueryOutcome::Empty) => warn!("No rows returned by '{}' for: {}", self.key, FIXED_QUERY),
            Err(_) => (),
        }
        result
    }

    // ---------------------------------------------------------------------------
    // read_first_row:
    // ---------------------------------------------------------------------------
    /** Only the first row is consumed.  The stream, and with it the server
     * side cursor, is dropped before this function returns.
     */
    async fn read_first_row(&self, conn: &mut AnyConnection) -> Result<QueryOutcome, QueryError> {
        let mut rows = sqlx::query(FIXED_QUERY).fetch(&mut *conn);
        let first = rows
            .try_next()
            .await
            .map_err(|source| QueryError::Execute { key: self.key.clone(), source })?;
        drop(rows);

        match first {
            Some(row) => MyTestRow::from_row(&row)
                .map(QueryOutcome::Row)
                .map_err(|source| QueryError::Read { key: self.key.clone(), source }),
            None => Ok(QueryOutcome::Empty),
        }
    }
}

// ***************************************************************************
//                                  Tests
// ***************************************************************************
#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::utils::config::ConnectionString;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    static DB_COUNTER: AtomicUsize = AtomicUsize::new(0);

    /// A throwaway SQLite file that stands in for the external store.
    pub struct TestDb {
        path: PathBuf,
    }

    impl TestDb {
        /// Create the MyTest table and insert the given rows.
        pub async fn new(rows: &[(&str, i64)]) -> Self {
            let n = DB_COUNTER.fetch_add(1, Ordering::SeqCst);
            let path = std::env::temp_dir()
                .join(format!("iwa-test-{}-{}.db", std::process::id(), n));
            let _ = std::fs::remove_file(&path);
            let db = Self { path };

            sqlx::any::install_default_drivers();
            let mut conn = AnyConnection::connect(&db.url()).await.unwrap();
            sqlx::query("CREATE TABLE MyTest (Name TEXT NOT NULL, Age INTEGER NOT NULL)")
                .execute(&mut conn)
                .await
                .unwrap();
            for (name, age) in rows {
                sqlx::query(&format!("INSERT INTO MyTest (Name, Age) VALUES ('{}', {})", name, age))
                    .execute(&mut conn)
                    .await
                    .unwrap();
            }
            conn.close().await.unwrap();
            db
        }

        pub fn url(&self) -> String {
            format!("sqlite://{}?mode=rwc", self.path.display())
        }
    }

    impl Drop for TestDb {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn query_for(key: &str, url: &str) -> FixedQuery {
        let mut config = Config::new();
        config.connection_strings.insert(key.to_string(), ConnectionString::new(url));
        FixedQuery::new(key, &config).unwrap()
    }

    #[test]
    fn row_display() {
        assert_eq!(MyTestRow::new("Bob", 30).to_string(), "Bob, 30");
    }

    #[test]
    fn null_columns_display_empty() {
        let row = MyTestRow { name: None, age: Some(30) };
        assert_eq!(row.to_string(), ", 30");
        let row = MyTestRow { name: Some("Bob".to_string()), age: None };
        assert_eq!(row.to_string(), "Bob, ");
    }

    #[test]
    fn missing_key_fails_construction() {
        let config = Config::new();
        assert!(matches!(FixedQuery::new("mydb", &config),
                         Err(Errors::MissingConnectionString(_))));
    }

    #[tokio::test]
    async fn first_row_only() {
        let db = TestDb::new(&[("Bob", 30), ("Carol", 41)]).await;
        let query = query_for("mydb", &db.url());
        let outcome = query.run().await.unwrap();
        assert_eq!(outcome, QueryOutcome::Row(MyTestRow::new("Bob", 30)));
        assert_eq!(query.tally().opened(), 1);
        assert_eq!(query.tally().released(), 1);
    }

    #[tokio::test]
    async fn empty_table_is_not_an_error() {
        let db = TestDb::new(&[]).await;
        let query = query_for("mydb", &db.url());
        for _ in 0..3 {
            assert_eq!(query.run().await.unwrap(), QueryOutcome::Empty);
        }
        assert_eq!(query.tally().opened(), 3);
        assert_eq!(query.tally().outstanding(), 0);
    }

    #[tokio::test]
    async fn missing_table_is_an_execute_error() {
        let db = TestDb::new(&[]).await;
        let query = query_for("mydb", &db.url());
        {
            let mut conn = AnyConnection::connect(&db.url()).await.unwrap();
            sqlx::query("DROP TABLE MyTest").execute(&mut conn).await.unwrap();
            conn.close().await.unwrap();
        }
        let err = query.run().await.unwrap_err();
        assert!(matches!(err, QueryError::Execute { .. }));
        assert_eq!(query.tally().opened(), 1);
        assert_eq!(query.tally().released(), 1);
    }

    #[tokio::test]
    async fn wrong_columns_is_a_read_error() {
        let db = TestDb::new(&[]).await;
        {
            let mut conn = AnyConnection::connect(&db.url()).await.unwrap();
            sqlx::query("DROP TABLE MyTest").execute(&mut conn).await.unwrap();
            sqlx::query("CREATE TABLE MyTest (Label TEXT NOT NULL)").execute(&mut conn).await.unwrap();
            sqlx::query("INSERT INTO MyTest (Label) VALUES ('x')").execute(&mut conn).await.unwrap();
            conn.close().await.unwrap();
        }
        let query = query_for("mydb", &db.url());
        let err = query.run().await.unwrap_err();
        assert!(matches!(err, QueryError::Read { .. }));
        assert_eq!(query.tally().outstanding(), 0);
    }

    /// Replace MyTest with a table created by the given statement and rows.
    async fn recreate_table(db: &TestDb, create: &str, inserts: &[&str]) {
        let mut conn = AnyConnection::connect(&db.url()).await.unwrap();
        sqlx::query("DROP TABLE MyTest").execute(&mut conn).await.unwrap();
        sqlx::query(create).execute(&mut conn).await.unwrap();
        for insert in inserts {
            sqlx::query(insert).execute(&mut conn).await.unwrap();
        }
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn lower_case_columns_are_found() {
        let db = TestDb::new(&[]).await;
        recreate_table(&db, "CREATE TABLE mytest (name TEXT, age INTEGER)",
                       &["INSERT INTO mytest (name, age) VALUES ('Bob', 30)"]).await;
        let query = query_for("mydb", &db.url());
        assert_eq!(query.run().await.unwrap(), QueryOutcome::Row(MyTestRow::new("Bob", 30)));
        assert_eq!(query.tally().outstanding(), 0);
    }

    #[tokio::test]
    async fn null_name_is_not_an_error() {
        let db = TestDb::new(&[]).await;
        recreate_table(&db, "CREATE TABLE MyTest (Name TEXT, Age INTEGER)",
                       &["INSERT INTO MyTest (Name, Age) VALUES (NULL, 30)"]).await;
        let query = query_for("mydb", &db.url());
        match query.run().await.unwrap() {
            QueryOutcome::Row(row) => assert_eq!(row.to_string(), ", 30"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unreachable_database_is_a_connect_error() {
        let path = std::env::temp_dir().join("iwa-no-such-dir").join("missing.db");
        let query = query_for("mydb", &format!("sqlite://{}?mode=ro", path.display()));
        let err = query.run().await.unwrap_err();
        assert!(err.is_connect());
        assert_eq!(query.tally().opened(), 0);
        assert_eq!(query.tally().released(), 0);
    }
}
