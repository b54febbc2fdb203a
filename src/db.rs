// Copyright: Kyler Chin <kyler@catenarymaps.org>
// Catenary Transit Initiatives
// Removal of the attribution is not allowed, as covered under the AGPL license

use tokio_postgres::NoTls;

/// The process's single database handle: one client plus the spawned task
/// driving its connection. The ingester owns this exclusively; it must be
/// closed before a maintenance subprocess touches the same database and
/// reopened afterward.
pub struct Db {
    client: tokio_postgres::Client,
    connection_task: tokio::task::JoinHandle<()>,
}

impl Db {
    pub async fn connect(database_url: &str) -> Result<Db, tokio_postgres::Error> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls).await?;

        // The connection object performs the actual communication with the
        // database, so spawn it off to run on its own.
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::error!("postgres connection error: {}", e);
            }
        });

        Ok(Db {
            client,
            connection_task,
        })
    }

    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut tokio_postgres::Client {
        &mut self.client
    }

    /// Drop the client and wait for the connection task to wind down.
    pub async fn close(self) {
        drop(self.client);
        if let Err(e) = self.connection_task.await {
            if !e.is_cancelled() {
                log::warn!("postgres connection task ended abnormally: {}", e);
            }
        }
    }
}
