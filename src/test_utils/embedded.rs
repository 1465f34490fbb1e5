use std::path::PathBuf;
use std::time::Duration;

use postgresql_embedded::PostgreSQL;

use super::SHARED_RUNTIME;
use crate::config::{BrokerConfig, DatabaseConfig, PoolSettings, TunnelConfig};
use crate::pool::DialTarget;

/// A running embedded `PostgreSQL` instance.
pub struct EmbeddedPostgres {
    pub postgresql: PostgreSQL,
    pub host: String,
    pub port: u16,
    /// Credentials for the database created for this instance.
    pub database: DatabaseConfig,
}

impl EmbeddedPostgres {
    /// Start a server and create `dbname` on it.
    ///
    /// # Errors
    /// Returns an error if the server cannot be set up or started, or the database
    /// cannot be created.
    pub async fn start(dbname: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let mut postgresql = PostgreSQL::default();
        postgresql.setup().await?;
        postgresql.start().await?;
        postgresql.create_database(dbname).await?;

        let settings = postgresql.settings();
        let host = settings.host.clone();
        let port = settings.port;
        let database = DatabaseConfig {
            user: settings.username.clone(),
            password: settings.password.clone(),
            dbname: dbname.to_string(),
        };
        println!("PostgreSQL started on {host}:{port}, database {dbname}");

        Ok(Self {
            postgresql,
            host,
            port,
            database,
        })
    }

    pub async fn stop(self) {
        let _ = self.postgresql.stop().await;
    }

    /// Dial the server directly, the way the pool dials a tunnel's local port.
    #[must_use]
    pub fn dial_target(&self) -> DialTarget<'_> {
        DialTarget::loopback(self.port, &self.database)
    }

    /// A complete config whose database side points at this server.
    ///
    /// The tunnel side names an unreachable bastion; it is only usable with a
    /// broker assembled without starting the tunnel.
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            tunnel: TunnelConfig {
                ssh_host: "bastion.invalid".to_string(),
                ssh_port: 22,
                ssh_user: "tester".to_string(),
                key_path: PathBuf::from("/dev/null"),
                key_passphrase: None,
                remote_host: "127.0.0.1".to_string(),
                remote_port: self.port,
                strict_host_key_checking: false,
                known_hosts: None,
                connect_timeout: Duration::from_secs(5),
            },
            database: self.database.clone(),
            pool: PoolSettings::default(),
            translate_placeholders: true,
        }
    }
}

/// Blocking form of [`EmbeddedPostgres::start`] for synchronous tests.
///
/// # Errors
/// See [`EmbeddedPostgres::start`].
pub fn setup_postgres_embedded(
    dbname: &str,
) -> Result<EmbeddedPostgres, Box<dyn std::error::Error>> {
    SHARED_RUNTIME.block_on(EmbeddedPostgres::start(dbname))
}

/// Stop an instance started with [`setup_postgres_embedded`].
pub fn stop_postgres_embedded(postgres: EmbeddedPostgres) {
    SHARED_RUNTIME.block_on(postgres.stop());
}
