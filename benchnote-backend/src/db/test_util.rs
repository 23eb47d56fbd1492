use diesel_async::{
    AsyncPgConnection,
    pooled_connection::{
        AsyncDieselConnectionManager,
        deadpool::{Object, Pool},
    },
};
use rstest::fixture;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::{
    db::model::{
        Write,
        experiment::{ExperimentPayload, NewExperiment},
        group::{DEFAULT_JOIN_CODE_ATTEMPTS, GroupSummary, NewGroup},
        person::{NewPerson, Person},
    },
    server::{run_migrations, util::DevContainer},
};

struct TestState {
    _container: DevContainer,
    db_pool: Pool<AsyncPgConnection>,
}

impl TestState {
    async fn new() -> Self {
        let name = "benchnote-backend_unit_test";
        let container = DevContainer::new(name).await.unwrap();

        let db_config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(
            container.db_url().await.unwrap(),
        );
        let db_pool = Pool::builder(db_config).build().unwrap();

        let db_conn = db_pool.get().await.unwrap();
        run_migrations(db_conn).await.unwrap();

        Self {
            _container: container,
            db_pool,
        }
    }
}

static TEST_STATE: OnceCell<TestState> = OnceCell::const_new();
pub type DbConnection = Object<AsyncPgConnection>;

#[fixture]
pub async fn db_conn() -> DbConnection {
    let test_state = TEST_STATE.get_or_init(TestState::new).await;

    test_state.db_pool.get().await.unwrap()
}

// Uuid-suffixed emails keep concurrently-running tests from contending on
// the unique constraint while their transactions are open.
pub async fn new_person(label: &str, db_conn: &mut AsyncPgConnection) -> Person {
    NewPerson {
        name: label.to_string(),
        email: format!("{label}-{}@example.org", Uuid::new_v4()),
        password_hash: "$argon2id$not-a-real-hash".to_string(),
    }
    .write(db_conn)
    .await
    .unwrap()
}

pub async fn new_group(name: &str, owner: i32, db_conn: &mut AsyncPgConnection) -> GroupSummary {
    NewGroup {
        name: name.to_string(),
    }
    .create(owner, DEFAULT_JOIN_CODE_ATTEMPTS, db_conn)
    .await
    .unwrap()
}

pub async fn new_experiment(
    external_id: &str,
    owner: i32,
    db_conn: &mut AsyncPgConnection,
) -> ExperimentPayload {
    NewExperiment {
        id: Some(external_id.to_string()),
        title: format!("{external_id} title"),
        status: None,
        start_date: None,
        hypothesis: None,
        protocol: None,
        analysis: None,
    }
    .create(owner, db_conn)
    .await
    .unwrap()
}
