use testcontainers_modules::{
    postgres::Postgres,
    testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner},
};

/// A disposable host-auth Postgres for dev mode and tests. The database
/// lives exactly as long as this struct.
pub struct DevContainer {
    container: ContainerAsync<Postgres>,
}

impl DevContainer {
    /// # Errors
    pub async fn new(container_name: &str) -> anyhow::Result<Self> {
        let postgres_version = "17-alpine";

        let container = Postgres::default()
            .with_host_auth()
            .with_tag(postgres_version)
            .with_container_name(container_name)
            .start()
            .await?;

        Ok(Self { container })
    }

    /// # Errors
    pub async fn db_url(&self) -> anyhow::Result<String> {
        let Self { container } = self;

        Ok(format!(
            "postgres://postgres@{}:{}/postgres",
            container.get_host().await?,
            container.get_host_port_ipv4(5432).await?
        ))
    }
}
