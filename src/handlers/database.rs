//! Development databases on a local server.
//!
//! Each database decl gets its own database on the configured server, named
//! `<module>_<decl>` in lower snake case. Creation is idempotent.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use tracing::{debug, info};
use url::Url;

use crate::provisioner::{HandlerContext, HandlerError, ResourceHandler};
use crate::schema::{
    DatabaseConnections, DatabaseEngine, DatabaseRuntimeEvent, Provisioned, ResourceSpec,
    RuntimeEvent,
};
use crate::utils::bootstrap::wait_for_tcp;
use crate::utils::naming::database_name;

/// SQLSTATE for `duplicate_database`.
const PG_DUPLICATE_DATABASE: &str = "42P04";

/// Creates databases on a local Postgres or MySQL server.
pub struct DatabaseHandler {
    engine: DatabaseEngine,
    admin_dsn: String,
    readiness_timeout: Duration,
}

impl DatabaseHandler {
    /// `admin_dsn` must allow `CREATE DATABASE`.
    pub fn new(engine: DatabaseEngine, admin_dsn: impl Into<String>, readiness_timeout: Duration) -> Self {
        Self {
            engine,
            admin_dsn: admin_dsn.into(),
            readiness_timeout,
        }
    }

    fn admin_url(&self) -> Result<Url, HandlerError> {
        Url::parse(&self.admin_dsn)
            .map_err(|e| HandlerError::Database(format!("invalid {} DSN: {}", self.engine, e)))
    }

    async fn ensure_postgres(&self, name: &str) -> Result<(), HandlerError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.readiness_timeout)
            .connect(&self.admin_dsn)
            .await?;
        let exists = sqlx::query("SELECT 1 FROM pg_catalog.pg_database WHERE datname = $1")
            .bind(name)
            .fetch_optional(&pool)
            .await?
            .is_some();
        if !exists {
            let create = format!("CREATE DATABASE {}", quote_postgres(name));
            match sqlx::raw_sql(&create).execute(&pool).await {
                Ok(_) => info!(database = %name, "Created postgres database"),
                Err(sqlx::Error::Database(err))
                    if err.code().as_deref() == Some(PG_DUPLICATE_DATABASE) =>
                {
                    debug!(database = %name, "Database created concurrently");
                }
                Err(err) => {
                    pool.close().await;
                    return Err(err.into());
                }
            }
        }
        pool.close().await;
        Ok(())
    }

    async fn ensure_mysql(&self, name: &str) -> Result<(), HandlerError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.readiness_timeout)
            .connect(&self.admin_dsn)
            .await?;
        let exists = sqlx::query("SELECT 1 FROM INFORMATION_SCHEMA.SCHEMATA WHERE SCHEMA_NAME = ?")
            .bind(name)
            .fetch_optional(&pool)
            .await?
            .is_some();
        if !exists {
            let create = format!("CREATE DATABASE IF NOT EXISTS {}", quote_mysql(name));
            let created = sqlx::raw_sql(&create).execute(&pool).await;
            if let Err(err) = created {
                pool.close().await;
                return Err(err.into());
            }
            info!(database = %name, "Created mysql database");
        }
        pool.close().await;
        Ok(())
    }
}

fn quote_postgres(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_mysql(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// `host:port` to probe before connecting.
pub(crate) fn readiness_address(engine: DatabaseEngine, url: &Url) -> Result<String, HandlerError> {
    let host = url
        .host_str()
        .ok_or_else(|| HandlerError::Database(format!("{} DSN has no host", engine)))?;
    let port = url.port().unwrap_or(match engine {
        DatabaseEngine::Postgres => 5432,
        DatabaseEngine::Mysql => 3306,
    });
    Ok(format!("{}:{}", host, port))
}

/// DSN handed to the module for database `name`.
///
/// MySQL DSNs use the `user:password@tcp(host:port)/name` form.
pub(crate) fn database_dsn(engine: DatabaseEngine, admin: &Url, name: &str) -> Result<String, HandlerError> {
    match engine {
        DatabaseEngine::Postgres => {
            let mut dsn = admin.clone();
            dsn.set_path(&format!("/{}", name));
            Ok(dsn.to_string())
        }
        DatabaseEngine::Mysql => {
            let address = readiness_address(engine, admin)?;
            let credentials = match admin.password() {
                Some(password) => format!("{}:{}", admin.username(), password),
                None => admin.username().to_string(),
            };
            Ok(format!("{}@tcp({})/{}", credentials, address, name))
        }
    }
}

#[async_trait]
impl ResourceHandler for DatabaseHandler {
    #[tracing::instrument(
        name = "handler.database",
        skip_all,
        fields(module = %ctx.module_name(), resource_id = %resource.resource_id, engine = %self.engine)
    )]
    async fn provision(
        &self,
        ctx: &HandlerContext,
        resource: &Provisioned,
        _previous: Option<&Provisioned>,
    ) -> Result<Option<RuntimeEvent>, HandlerError> {
        match &resource.spec {
            ResourceSpec::Database { engine } if *engine == self.engine => {}
            other => {
                return Err(HandlerError::Database(format!(
                    "{} handler cannot provision {:?}",
                    self.engine, other
                )))
            }
        }

        let name = database_name(ctx.module_name(), &resource.resource_id);
        let admin = self.admin_url()?;
        let address = readiness_address(self.engine, &admin)?;
        wait_for_tcp(&address, self.readiness_timeout)
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))?;

        match self.engine {
            DatabaseEngine::Postgres => self.ensure_postgres(&name).await?,
            DatabaseEngine::Mysql => self.ensure_mysql(&name).await?,
        }

        let dsn = database_dsn(self.engine, &admin, &name)?;
        Ok(Some(RuntimeEvent::Database(DatabaseRuntimeEvent {
            id: resource.resource_id.clone(),
            connections: Some(DatabaseConnections {
                read: dsn.clone(),
                write: dsn,
            }),
            migration_digest: None,
        })))
    }
}
