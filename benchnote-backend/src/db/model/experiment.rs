use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use diesel::{pg::Pg, prelude::*};
use diesel_async::RunQueryDsl;
use garde::Validate;
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use valuable::Valuable;

use crate::{
    db::{error::Error, model::Write},
    schema::{
        experiment::{
            self, analysis as analysis_col, created_at as experiment_created_at_col,
            external_id as external_id_col, hypothesis as hypothesis_col, id as experiment_id_col,
            owner_id as owner_col, protocol as protocol_col, start_date as start_date_col,
            status as status_col, title as title_col,
        },
        experiment_file::{
            self, created_at as file_created_at_col, experiment_id as file_experiment_col,
            id as file_id_col, storage_key as storage_key_col,
        },
        experiment_log::{
            self, content as content_col, experiment_id as log_experiment_col,
            logged_at as logged_at_col,
        },
        group_membership::{self, group_id as membership_group_col, member_id as member_col},
        person::{self, name as person_name_col},
    },
};

static EXTERNAL_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z0-9_-]{1,50}$").unwrap());

#[must_use]
pub fn is_valid_external_id(id: &str) -> bool {
    EXTERNAL_ID_RE.is_match(id)
}

/// Which owners' experiments a listing should cover.
#[derive(Clone, Copy, Debug, Default, Deserialize, Valuable)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    #[serde(rename = "self")]
    Own,
    Group,
}

// The equivalence set behind group visibility: the requester plus every
// member of every group the requester belongs to, as one subquery so the
// resolver never walks memberships row by row.
macro_rules! equivalence_set {
    ($requester:expr) => {{
        let groups = group_membership::table
            .filter(member_col.eq($requester))
            .select(membership_group_col)
            .into_boxed();

        group_membership::table
            .filter(membership_group_col.eq_any(groups))
            .select(member_col)
    }};
}

fn external_id_format(id: &str, _context: &()) -> garde::Result {
    if EXTERNAL_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(garde::Error::new(
            "experiment ids are 1-50 characters of [A-Za-z0-9_-]",
        ))
    }
}

#[derive(Deserialize, Validate, Valuable)]
#[garde(allow_unvalidated)]
pub struct NewExperiment {
    #[garde(inner(custom(external_id_format)))]
    pub id: Option<String>,
    #[garde(length(max = 500))]
    #[serde(default)]
    pub title: String,
    pub status: Option<String>,
    pub start_date: Option<String>,
    pub hypothesis: Option<String>,
    pub protocol: Option<String>,
    pub analysis: Option<String>,
}

impl NewExperiment {
    /// The returned payload's id is authoritative: a colliding request id is
    /// disambiguated with a seconds suffix, once, rather than rejected.
    pub async fn create(
        self,
        owner: i32,
        db_conn: &mut diesel_async::AsyncPgConnection,
    ) -> super::error::Result<ExperimentPayload> {
        let Self {
            id,
            title,
            status,
            start_date,
            hypothesis,
            protocol,
            analysis,
        } = self;

        let now = Utc::now();
        let mut external_id =
            id.unwrap_or_else(|| format!("EXP-{}", now.format("%Y%m%d%H%M%S")));

        let taken: bool = diesel::select(diesel::dsl::exists(
            experiment::table.filter(external_id_col.eq(&external_id)),
        ))
        .get_result(db_conn)
        .await?;

        if taken {
            // Best-effort fallback, deliberately not retried; the UNIQUE
            // constraint still backs it.
            external_id = format!("{external_id}-{}", now.format("%S"));
        }

        let row_id: i32 = diesel::insert_into(experiment::table)
            .values((
                external_id_col.eq(&external_id),
                title_col.eq(&title),
                status_col.eq(status.as_deref().unwrap_or("Planning")),
                start_date_col.eq(start_date.unwrap_or_else(|| now.format("%Y-%m-%d").to_string())),
                owner_col.eq(owner),
                hypothesis_col.eq(hypothesis.unwrap_or_default()),
                protocol_col.eq(protocol.unwrap_or_default()),
                analysis_col.eq(analysis.unwrap_or_default()),
            ))
            .returning(experiment_id_col)
            .get_result(db_conn)
            .await?;

        fetch_by_row_id(row_id, db_conn).await
    }
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = experiment, check_for_backend(Pg))]
struct ExperimentRow {
    id: i32,
    external_id: String,
    title: String,
    status: String,
    start_date: String,
    owner_id: i32,
    hypothesis: String,
    protocol: String,
    analysis: String,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = experiment_log, check_for_backend(Pg))]
struct LogRow {
    experiment_id: i32,
    logged_at: String,
    content: String,
}

#[derive(Serialize, Queryable, Selectable, Debug)]
#[diesel(table_name = experiment_file, check_for_backend(Pg))]
pub struct FileRow {
    pub id: i32,
    #[serde(skip)]
    pub experiment_id: i32,
    pub original_name: String,
    #[serde(skip)]
    pub storage_key: String,
    pub byte_size: i64,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Debug)]
pub struct LogEntryPayload {
    pub timestamp: String,
    pub content: String,
}

#[derive(Serialize, Debug)]
pub struct ExperimentPayload {
    pub id: String,
    pub title: String,
    pub status: String,
    pub start_date: String,
    pub owner: String,
    pub owner_id: i32,
    pub hypothesis: String,
    pub protocol: String,
    pub analysis: String,
    pub logs: Vec<LogEntryPayload>,
    pub files: Vec<FileRow>,
}

async fn assemble(
    rows: Vec<(ExperimentRow, String)>,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<Vec<ExperimentPayload>> {
    let row_ids: Vec<i32> = rows.iter().map(|(row, _)| row.id).collect();

    let logs: Vec<LogRow> = experiment_log::table
        .filter(log_experiment_col.eq_any(&row_ids))
        .order((log_experiment_col.asc(), logged_at_col.asc()))
        .select(LogRow::as_select())
        .load(db_conn)
        .await?;

    let files: Vec<FileRow> = experiment_file::table
        .filter(file_experiment_col.eq_any(&row_ids))
        .order((file_experiment_col.asc(), file_created_at_col.asc()))
        .select(FileRow::as_select())
        .load(db_conn)
        .await?;

    let mut logs_by_experiment = logs
        .into_iter()
        .map(|log| (log.experiment_id, log))
        .into_group_map();
    let mut files_by_experiment = files
        .into_iter()
        .map(|file| (file.experiment_id, file))
        .into_group_map();

    let payloads = rows
        .into_iter()
        .map(|(row, owner_name)| ExperimentPayload {
            logs: logs_by_experiment
                .remove(&row.id)
                .unwrap_or_default()
                .into_iter()
                .map(|log| LogEntryPayload {
                    timestamp: log.logged_at,
                    content: log.content,
                })
                .collect(),
            files: files_by_experiment.remove(&row.id).unwrap_or_default(),
            id: row.external_id,
            title: row.title,
            status: row.status,
            start_date: row.start_date,
            owner: owner_name,
            owner_id: row.owner_id,
            hypothesis: row.hypothesis,
            protocol: row.protocol,
            analysis: row.analysis,
        })
        .collect();

    Ok(payloads)
}

async fn fetch_by_row_id(
    row_id: i32,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<ExperimentPayload> {
    let row: (ExperimentRow, String) = experiment::table
        .inner_join(person::table)
        .filter(experiment_id_col.eq(row_id))
        .select((ExperimentRow::as_select(), person_name_col))
        .first(db_conn)
        .await?;

    assemble(vec![row], db_conn)
        .await?
        .into_iter()
        .next()
        .ok_or(Error::RecordNotFound)
}

pub async fn list_visible(
    requester: i32,
    scope: Scope,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<Vec<ExperimentPayload>> {
    let rows: Vec<(ExperimentRow, String)> = match scope {
        Scope::Own => {
            experiment::table
                .inner_join(person::table)
                .filter(owner_col.eq(requester))
                .order(experiment_created_at_col.asc())
                .select((ExperimentRow::as_select(), person_name_col))
                .load(db_conn)
                .await?
        }
        Scope::Group => {
            // Requester's own experiments first; the remainder of the order
            // carries no meaning and callers must not rely on it.
            experiment::table
                .inner_join(person::table)
                .filter(
                    owner_col
                        .eq(requester)
                        .or(owner_col.eq_any(equivalence_set!(requester))),
                )
                .order((
                    owner_col.eq(requester).desc(),
                    experiment_created_at_col.asc(),
                ))
                .select((ExperimentRow::as_select(), person_name_col))
                .load(db_conn)
                .await?
        }
    };

    assemble(rows, db_conn).await
}

/// Single-item fetch is always group-inclusive, whatever scope a listing
/// used. A hidden experiment and a nonexistent one are the same
/// `RecordNotFound`; callers cannot probe for existence.
pub async fn fetch_visible(
    requester: i32,
    external_id: &str,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<ExperimentPayload> {
    let row: (ExperimentRow, String) = experiment::table
        .inner_join(person::table)
        .filter(external_id_col.eq(external_id))
        .filter(
            owner_col
                .eq(requester)
                .or(owner_col.eq_any(equivalence_set!(requester))),
        )
        .select((ExperimentRow::as_select(), person_name_col))
        .first(db_conn)
        .await?;

    assemble(vec![row], db_conn)
        .await?
        .into_iter()
        .next()
        .ok_or(Error::RecordNotFound)
}

// Write-path guard: owner only, no equivalence-set expansion. A non-owner
// gets the same RecordNotFound as a miss.
async fn owned_row_id(
    owner: i32,
    external_id: &str,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<i32> {
    Ok(experiment::table
        .filter(external_id_col.eq(external_id))
        .filter(owner_col.eq(owner))
        .select(experiment_id_col)
        .first(db_conn)
        .await?)
}

#[derive(Deserialize, Validate, Valuable, AsChangeset)]
#[diesel(table_name = experiment)]
#[garde(allow_unvalidated)]
pub struct ExperimentUpdate {
    #[garde(length(max = 500))]
    pub title: Option<String>,
    pub status: Option<String>,
    pub hypothesis: Option<String>,
    pub protocol: Option<String>,
    pub analysis: Option<String>,
}

#[derive(Deserialize, Validate, Valuable)]
#[garde(allow_unvalidated)]
pub struct ExperimentPatch {
    #[serde(flatten)]
    #[garde(dive)]
    pub fields: ExperimentUpdate,
    #[garde(dive)]
    pub logs: Option<Vec<NewLogEntry>>,
}

impl ExperimentPatch {
    pub async fn apply(
        self,
        owner: i32,
        external_id: &str,
        db_conn: &mut diesel_async::AsyncPgConnection,
    ) -> super::error::Result<ExperimentPayload> {
        let row_id = owned_row_id(owner, external_id, db_conn).await?;

        let Self { fields, logs } = self;

        if let ExperimentUpdate {
            title: None,
            status: None,
            hypothesis: None,
            protocol: None,
            analysis: None,
        } = &fields
        {
        } else {
            diesel::update(experiment::table.filter(experiment_id_col.eq(row_id)))
                .set(&fields)
                .execute(db_conn)
                .await?;
        }

        // A present `logs` field replaces the whole collection; entries the
        // caller left out are gone.
        if let Some(entries) = logs {
            diesel::delete(experiment_log::table.filter(log_experiment_col.eq(row_id)))
                .execute(db_conn)
                .await?;

            insert_log_rows(row_id, entries, db_conn).await?;
        }

        fetch_by_row_id(row_id, db_conn).await
    }
}

#[derive(Deserialize, Validate, Valuable)]
#[garde(allow_unvalidated)]
pub struct NewLogEntry {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub content: String,
}

async fn insert_log_rows(
    row_id: i32,
    entries: Vec<NewLogEntry>,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<()> {
    if entries.is_empty() {
        return Ok(());
    }

    let now = Utc::now();
    let rows: Vec<_> = entries
        .into_iter()
        .map(|NewLogEntry { timestamp, content }| {
            (
                log_experiment_col.eq(row_id),
                logged_at_col
                    .eq(timestamp.unwrap_or_else(|| now.format("%Y-%m-%d %I:%M %p").to_string())),
                content_col.eq(content),
            )
        })
        .collect();

    diesel::insert_into(experiment_log::table)
        .values(rows)
        .execute(db_conn)
        .await?;

    Ok(())
}

/// Appends one entry without re-sorting anything; ordering happens at read
/// time over the timestamp strings.
pub async fn add_log(
    owner: i32,
    external_id: &str,
    entry: NewLogEntry,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<ExperimentPayload> {
    let row_id = owned_row_id(owner, external_id, db_conn).await?;

    insert_log_rows(row_id, vec![entry], db_conn).await?;

    fetch_by_row_id(row_id, db_conn).await
}

/// Deletes the experiment; logs and file rows go with it via the cascade.
/// Returns the orphaned storage keys so the caller can drop the blobs once
/// the transaction commits.
pub async fn delete(
    owner: i32,
    external_id: &str,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<Vec<String>> {
    let row_id = owned_row_id(owner, external_id, db_conn).await?;

    let storage_keys = experiment_file::table
        .filter(file_experiment_col.eq(row_id))
        .select(storage_key_col)
        .load(db_conn)
        .await?;

    diesel::delete(experiment::table.filter(experiment_id_col.eq(row_id)))
        .execute(db_conn)
        .await?;

    Ok(storage_keys)
}

#[derive(Insertable)]
#[diesel(table_name = experiment_file, check_for_backend(Pg))]
pub struct NewFile {
    pub experiment_id: i32,
    pub original_name: String,
    pub storage_key: String,
    pub byte_size: i64,
    pub mime_type: String,
}

impl Write for NewFile {
    type Returns = ExperimentPayload;

    async fn write(
        self,
        db_conn: &mut diesel_async::AsyncPgConnection,
    ) -> super::error::Result<Self::Returns> {
        let experiment_row = self.experiment_id;

        diesel::insert_into(experiment_file::table)
            .values(&self)
            .execute(db_conn)
            .await?;

        fetch_by_row_id(experiment_row, db_conn).await
    }
}

pub async fn resolve_owned(
    owner: i32,
    external_id: &str,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<i32> {
    owned_row_id(owner, external_id, db_conn).await
}

pub async fn delete_file(
    owner: i32,
    external_id: &str,
    file_id: i32,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<(String, ExperimentPayload)> {
    let row_id = owned_row_id(owner, external_id, db_conn).await?;

    let storage_key: String = experiment_file::table
        .filter(file_id_col.eq(file_id))
        .filter(file_experiment_col.eq(row_id))
        .select(storage_key_col)
        .first(db_conn)
        .await?;

    diesel::delete(experiment_file::table.filter(file_id_col.eq(file_id)))
        .execute(db_conn)
        .await?;

    let payload = fetch_by_row_id(row_id, db_conn).await?;

    Ok((storage_key, payload))
}

pub async fn file_for_download(
    owner: i32,
    external_id: &str,
    file_id: i32,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<FileRow> {
    let row_id = owned_row_id(owner, external_id, db_conn).await?;

    Ok(experiment_file::table
        .filter(file_id_col.eq(file_id))
        .filter(file_experiment_col.eq(row_id))
        .select(FileRow::as_select())
        .first(db_conn)
        .await?)
}

#[cfg(test)]
mod tests {
    use diesel_async::{AsyncConnection, scoped_futures::ScopedFutureExt};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::db::{
        model::group,
        test_util::{DbConnection, db_conn, new_experiment, new_group, new_person},
    };

    fn log(timestamp: &str, content: &str) -> NewLogEntry {
        NewLogEntry {
            timestamp: Some(timestamp.to_string()),
            content: content.to_string(),
        }
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn group_scope_reads_co_member_experiments(#[future] mut db_conn: DbConnection) {
        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let alice = new_person("alice", conn).await;
                    let bob = new_person("bob", conn).await;
                    let carol = new_person("carol", conn).await;

                    let lab = new_group("Lab1", alice.id, conn).await;
                    group::join_by_code(bob.id, &lab.code, conn).await?;

                    let created = new_experiment("EXP-1", alice.id, conn).await;
                    assert_eq!(created.id, "EXP-1");

                    // Self scope stays owner-only
                    assert!(list_visible(bob.id, Scope::Own, conn).await?.is_empty());

                    let group_scope = list_visible(bob.id, Scope::Group, conn).await?;
                    assert_eq!(group_scope.len(), 1);
                    assert_eq!(group_scope[0].id, "EXP-1");
                    assert_eq!(group_scope[0].owner_id, alice.id);

                    // A stranger sees nothing under any scope
                    assert!(list_visible(carol.id, Scope::Group, conn).await?.is_empty());

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn own_experiments_list_first_under_group_scope(#[future] mut db_conn: DbConnection) {
        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let alice = new_person("alice", conn).await;
                    let bob = new_person("bob", conn).await;
                    let lab = new_group("Lab1", alice.id, conn).await;
                    group::join_by_code(bob.id, &lab.code, conn).await?;

                    new_experiment("ALICE-1", alice.id, conn).await;
                    new_experiment("BOB-1", bob.id, conn).await;

                    let listed = list_visible(bob.id, Scope::Group, conn).await?;
                    assert_eq!(listed.len(), 2);
                    assert_eq!(listed[0].id, "BOB-1");

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn single_fetch_is_group_inclusive_and_hides_existence(
        #[future] mut db_conn: DbConnection,
    ) {
        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let alice = new_person("alice", conn).await;
                    let bob = new_person("bob", conn).await;
                    let carol = new_person("carol", conn).await;

                    let lab = new_group("Lab1", alice.id, conn).await;
                    group::join_by_code(bob.id, &lab.code, conn).await?;

                    new_experiment("EXP-1", alice.id, conn).await;

                    let fetched = fetch_visible(bob.id, "EXP-1", conn).await?;
                    assert_eq!(fetched.owner, alice.name);

                    // Hidden and absent must be indistinguishable
                    let hidden = fetch_visible(carol.id, "EXP-1", conn).await.unwrap_err();
                    let absent = fetch_visible(carol.id, "EXP-404", conn).await.unwrap_err();
                    assert!(matches!(hidden, Error::RecordNotFound));
                    assert!(matches!(absent, Error::RecordNotFound));

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn co_members_cannot_mutate(#[future] mut db_conn: DbConnection) {
        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let alice = new_person("alice", conn).await;
                    let bob = new_person("bob", conn).await;
                    let lab = new_group("Lab1", alice.id, conn).await;
                    group::join_by_code(bob.id, &lab.code, conn).await?;

                    new_experiment("EXP-1", alice.id, conn).await;

                    let patch = ExperimentPatch {
                        fields: ExperimentUpdate {
                            title: Some("hijacked".to_string()),
                            status: None,
                            hypothesis: None,
                            protocol: None,
                            analysis: None,
                        },
                        logs: None,
                    };
                    let err = patch.apply(bob.id, "EXP-1", conn).await.unwrap_err();
                    assert!(matches!(err, Error::RecordNotFound));

                    let err = delete(bob.id, "EXP-1", conn).await.unwrap_err();
                    assert!(matches!(err, Error::RecordNotFound));

                    let err = add_log(bob.id, "EXP-1", log("2026-01-01 09:00 AM", "hi"), conn)
                        .await
                        .unwrap_err();
                    assert!(matches!(err, Error::RecordNotFound));

                    // Readable all along
                    assert!(fetch_visible(bob.id, "EXP-1", conn).await.is_ok());

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn update_replaces_the_full_log_collection(#[future] mut db_conn: DbConnection) {
        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let alice = new_person("alice", conn).await;
                    new_experiment("EXP-1", alice.id, conn).await;

                    add_log(alice.id, "EXP-1", log("2026-01-01 09:00 AM", "seeded"), conn).await?;
                    add_log(alice.id, "EXP-1", log("2026-01-02 09:00 AM", "incubated"), conn)
                        .await?;

                    let patch = ExperimentPatch {
                        fields: ExperimentUpdate {
                            title: None,
                            status: None,
                            hypothesis: None,
                            protocol: None,
                            analysis: None,
                        },
                        logs: Some(vec![log("2026-01-03 09:00 AM", "restarted")]),
                    };
                    let updated = patch.apply(alice.id, "EXP-1", conn).await?;

                    assert_eq!(updated.logs.len(), 1);
                    assert_eq!(updated.logs[0].content, "restarted");

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn partial_update_touches_only_present_fields(#[future] mut db_conn: DbConnection) {
        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let alice = new_person("alice", conn).await;
                    let created = NewExperiment {
                        id: Some("EXP-1".to_string()),
                        title: "original title".to_string(),
                        status: None,
                        start_date: None,
                        hypothesis: Some("it grows".to_string()),
                        protocol: None,
                        analysis: None,
                    }
                    .create(alice.id, conn)
                    .await?;
                    assert_eq!(created.status, "Planning");

                    let patch = ExperimentPatch {
                        fields: ExperimentUpdate {
                            title: None,
                            status: Some("Running".to_string()),
                            hypothesis: None,
                            protocol: None,
                            analysis: None,
                        },
                        logs: None,
                    };
                    let updated = patch.apply(alice.id, "EXP-1", conn).await?;

                    assert_eq!(updated.status, "Running");
                    assert_eq!(updated.title, "original title");
                    assert_eq!(updated.hypothesis, "it grows");

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn logs_read_back_ordered_by_timestamp_string(#[future] mut db_conn: DbConnection) {
        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let alice = new_person("alice", conn).await;
                    new_experiment("EXP-1", alice.id, conn).await;

                    add_log(alice.id, "EXP-1", log("2026-01-05 09:00 AM", "later"), conn).await?;
                    let read =
                        add_log(alice.id, "EXP-1", log("2026-01-02 09:00 AM", "earlier"), conn)
                            .await?;

                    let contents: Vec<_> = read.logs.iter().map(|l| l.content.as_str()).collect();
                    assert_eq!(contents, vec!["earlier", "later"]);

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn colliding_external_id_gets_one_suffix(#[future] mut db_conn: DbConnection) {
        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let alice = new_person("alice", conn).await;
                    new_experiment("EXP-1", alice.id, conn).await;

                    let second = new_experiment("EXP-1", alice.id, conn).await;
                    assert_ne!(second.id, "EXP-1");
                    assert!(second.id.starts_with("EXP-1-"), "{}", second.id);

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn generated_external_id_is_timestamp_derived(#[future] mut db_conn: DbConnection) {
        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let alice = new_person("alice", conn).await;

                    let created = NewExperiment {
                        id: None,
                        title: String::new(),
                        status: None,
                        start_date: None,
                        hypothesis: None,
                        protocol: None,
                        analysis: None,
                    }
                    .create(alice.id, conn)
                    .await?;

                    assert!(created.id.starts_with("EXP-"), "{}", created.id);
                    assert!(is_valid_external_id(&created.id));

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn delete_cascades_to_logs_and_files(#[future] mut db_conn: DbConnection) {
        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let alice = new_person("alice", conn).await;
                    new_experiment("EXP-1", alice.id, conn).await;

                    add_log(alice.id, "EXP-1", log("2026-01-01 09:00 AM", "one"), conn).await?;
                    add_log(alice.id, "EXP-1", log("2026-01-02 09:00 AM", "two"), conn).await?;

                    let row_id = resolve_owned(alice.id, "EXP-1", conn).await?;
                    NewFile {
                        experiment_id: row_id,
                        original_name: "gel.png".to_string(),
                        storage_key: "00000000-0000-0000-0000-000000000000.png".to_string(),
                        byte_size: 4,
                        mime_type: "image/png".to_string(),
                    }
                    .write(conn)
                    .await?;

                    let orphaned = delete(alice.id, "EXP-1", conn).await?;
                    assert_eq!(
                        orphaned,
                        vec!["00000000-0000-0000-0000-000000000000.png".to_string()]
                    );

                    let err = fetch_visible(alice.id, "EXP-1", conn).await.unwrap_err();
                    assert!(matches!(err, Error::RecordNotFound));

                    let leftover_logs: i64 = experiment_log::table
                        .filter(log_experiment_col.eq(row_id))
                        .count()
                        .get_result(conn)
                        .await?;
                    assert_eq!(leftover_logs, 0);

                    let leftover_files: i64 = experiment_file::table
                        .filter(file_experiment_col.eq(row_id))
                        .count()
                        .get_result(conn)
                        .await?;
                    assert_eq!(leftover_files, 0);

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }
}
