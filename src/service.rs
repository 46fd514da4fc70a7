use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};
use tokio_util::task::TaskTracker;

use crate::{
    config::Config,
    consumer::{self, SyncReport},
    db::message::Message,
    dispatch::DispatchTable,
};

/// Shared application state: the connection pool, the outbound HTTP client,
/// and the dispatch table, all constructed once and passed explicitly.
pub struct Service {
    db: SqlitePool,
    http: reqwest::Client,
    dispatch: DispatchTable,
    config: Config,
    tasks: TaskTracker,
}

impl Service {
    pub async fn connect() -> eyre::Result<Self> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> eyre::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        let dispatch = DispatchTable::from_config(&config)?;

        let http = reqwest::Client::builder().build()?;

        Ok(Self {
            db: pool,
            http,
            dispatch,
            config,
            tasks: TaskTracker::new(),
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn dispatch_table(&self) -> &DispatchTable {
        &self.dispatch
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Enqueue a raw message body on a named queue.
    pub async fn enqueue(
        &self,
        queue: impl AsRef<str>,
        body: impl AsRef<str>,
    ) -> eyre::Result<i64> {
        let mut conn = self.db.acquire().await?;
        Message::send(&mut conn, queue, body).await
    }

    /// Drain one batch from a named queue. See [`consumer::sync`].
    pub async fn sync(&self, queue: impl AsRef<str>) -> eyre::Result<SyncReport> {
        consumer::sync(self, queue.as_ref()).await
    }

    /// Wait for every tracked background task to finish. Called once on
    /// shutdown so fire-and-forget syncs are not torn down mid-batch.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}
