use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diesel::{dsl::count_star, pg::Pg, prelude::*};
use diesel_async::RunQueryDsl;
use garde::Validate;
use rand::Rng;
use serde::{Deserialize, Serialize};
use valuable::Valuable;

use crate::{
    db::{
        error::Error,
        model::{FetchById, Write},
    },
    schema::{
        group_membership::{
            self, group_id as membership_group_col, joined_at as joined_at_col,
            member_id as member_col,
        },
        person::{
            self, current_group_id as current_group_col, id as person_id_col,
            name as person_name_col,
        },
        research_group::{
            self, code as code_col, created_by as created_by_col, id as group_id_col,
            name as group_name_col,
        },
    },
};

const JOIN_CODE_LENGTH: usize = 6;
const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const DEFAULT_JOIN_CODE_ATTEMPTS: u32 = 32;

fn generate_join_code() -> String {
    let mut rng = rand::rng();

    (0..JOIN_CODE_LENGTH)
        .map(|_| JOIN_CODE_ALPHABET[rng.random_range(0..JOIN_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Normalized form of a caller-supplied join code. Codes are
/// case-insensitive on the way in but stored uppercase.
#[must_use]
pub fn normalize_join_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

#[must_use]
pub fn is_valid_join_code(code: &str) -> bool {
    code.len() == JOIN_CODE_LENGTH && code.chars().all(|c| c.is_ascii_alphanumeric())
}

#[derive(Deserialize, Validate, Valuable)]
#[garde(allow_unvalidated)]
pub struct JoinRequest {
    #[garde(length(min = 1, max = 20))]
    pub code: String,
}

#[derive(Deserialize, Validate, Valuable)]
#[garde(allow_unvalidated)]
pub struct NewGroup {
    #[garde(length(min = 1, max = 200))]
    pub name: String,
}

impl NewGroup {
    /// Creates the group, auto-joins the requester, and points their
    /// current-group selection at it. Callers run this inside one
    /// transaction so the three writes commit together.
    pub async fn create(
        self,
        requester: i32,
        max_code_attempts: u32,
        db_conn: &mut diesel_async::AsyncPgConnection,
    ) -> super::error::Result<GroupSummary> {
        let Self { name } = self;

        let mut code = None;
        for _ in 0..max_code_attempts {
            let candidate = generate_join_code();

            let taken: bool = diesel::select(diesel::dsl::exists(
                research_group::table.filter(code_col.eq(&candidate)),
            ))
            .get_result(db_conn)
            .await?;

            if !taken {
                code = Some(candidate);
                break;
            }
        }

        // The code column is UNIQUE, so a lost race between the check and the
        // insert still surfaces as DuplicateRecord rather than a silent dupe.
        let Some(code) = code else {
            return Err(Error::Other {
                message: format!("no unused join code found in {max_code_attempts} attempts"),
            });
        };

        let group_id: i32 = diesel::insert_into(research_group::table)
            .values((
                group_name_col.eq(&name),
                code_col.eq(&code),
                created_by_col.eq(requester),
            ))
            .returning(group_id_col)
            .get_result(db_conn)
            .await?;

        NewMembership {
            group_id,
            member_id: requester,
        }
        .write(db_conn)
        .await?;

        set_current_group(requester, Some(group_id), db_conn).await?;

        GroupSummary::fetch_by_id(&group_id, db_conn).await
    }
}

#[derive(Insertable)]
#[diesel(table_name = group_membership, check_for_backend(Pg))]
struct NewMembership {
    group_id: i32,
    member_id: i32,
}

impl Write for NewMembership {
    type Returns = ();

    async fn write(self, db_conn: &mut diesel_async::AsyncPgConnection) -> super::error::Result<()> {
        diesel::insert_into(group_membership::table)
            .values(&self)
            .execute(db_conn)
            .await?;

        Ok(())
    }
}

async fn set_current_group(
    requester: i32,
    group: Option<i32>,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<()> {
    diesel::update(person::table.filter(person_id_col.eq(requester)))
        .set(current_group_col.eq(group))
        .execute(db_conn)
        .await?;

    Ok(())
}

/// Join-by-code. Unknown codes are `RecordNotFound`; the membership pair is
/// UNIQUE, so joining twice comes back as `DuplicateRecord`.
pub async fn join_by_code(
    requester: i32,
    code: &str,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<GroupSummary> {
    let group_id: i32 = research_group::table
        .filter(code_col.eq(code))
        .select(group_id_col)
        .first(db_conn)
        .await?;

    NewMembership {
        group_id,
        member_id: requester,
    }
    .write(db_conn)
    .await?;

    set_current_group(requester, Some(group_id), db_conn).await?;

    GroupSummary::fetch_by_id(&group_id, db_conn).await
}

/// Membership delete and pointer clear commit together; a reader never sees
/// the pointer referencing a group the user has already left.
pub async fn leave(
    requester: i32,
    group_id: i32,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<()> {
    let deleted = diesel::delete(
        group_membership::table
            .filter(membership_group_col.eq(group_id))
            .filter(member_col.eq(requester)),
    )
    .execute(db_conn)
    .await?;

    if deleted == 0 {
        return Err(Error::RecordNotFound);
    }

    diesel::update(
        person::table
            .filter(person_id_col.eq(requester))
            .filter(current_group_col.eq(group_id)),
    )
    .set(current_group_col.eq(None::<i32>))
    .execute(db_conn)
    .await?;

    Ok(())
}

/// Sets the current-group pointer. Missing membership is `RecordNotFound`
/// here; the API layer reports it as Forbidden since the group itself may
/// well exist.
pub async fn select(
    requester: i32,
    group_id: i32,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<GroupSummary> {
    let is_member: bool = diesel::select(diesel::dsl::exists(
        group_membership::table
            .filter(membership_group_col.eq(group_id))
            .filter(member_col.eq(requester)),
    ))
    .get_result(db_conn)
    .await?;

    if !is_member {
        return Err(Error::RecordNotFound);
    }

    set_current_group(requester, Some(group_id), db_conn).await?;

    GroupSummary::fetch_by_id(&group_id, db_conn).await
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = research_group, check_for_backend(Pg))]
struct GroupRow {
    id: i32,
    name: String,
    code: String,
    created_at: DateTime<Utc>,
}

#[derive(Serialize, Debug)]
pub struct GroupSummary {
    pub id: i32,
    pub name: String,
    pub code: String,
    pub created_by: String,
    pub member_count: i64,
    pub created_at: DateTime<Utc>,
}

async fn with_member_counts(
    rows: Vec<(GroupRow, String)>,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<Vec<GroupSummary>> {
    let ids: Vec<i32> = rows.iter().map(|(group, _)| group.id).collect();

    let counts: HashMap<i32, i64> = group_membership::table
        .filter(membership_group_col.eq_any(&ids))
        .group_by(membership_group_col)
        .select((membership_group_col, count_star()))
        .load::<(i32, i64)>(db_conn)
        .await?
        .into_iter()
        .collect();

    let summaries = rows
        .into_iter()
        .map(|(group, created_by)| GroupSummary {
            member_count: counts.get(&group.id).copied().unwrap_or_default(),
            id: group.id,
            name: group.name,
            code: group.code,
            created_by,
            created_at: group.created_at,
        })
        .collect();

    Ok(summaries)
}

impl FetchById for GroupSummary {
    type Id = i32;

    async fn fetch_by_id(
        id: &Self::Id,
        db_conn: &mut diesel_async::AsyncPgConnection,
    ) -> super::error::Result<Self> {
        let row: (GroupRow, String) = research_group::table
            .inner_join(person::table)
            .filter(group_id_col.eq(id))
            .select((GroupRow::as_select(), person_name_col))
            .first(db_conn)
            .await?;

        with_member_counts(vec![row], db_conn)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::RecordNotFound)
    }
}

pub async fn list_for_member(
    requester: i32,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<Vec<GroupSummary>> {
    let rows: Vec<(GroupRow, String)> = group_membership::table
        .filter(member_col.eq(requester))
        .inner_join(research_group::table.inner_join(person::table))
        .order(joined_at_col.asc())
        .select((GroupRow::as_select(), person_name_col))
        .load(db_conn)
        .await?;

    with_member_counts(rows, db_conn).await
}

async fn current_group_id(
    requester: i32,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<Option<i32>> {
    Ok(person::table
        .filter(person_id_col.eq(requester))
        .select(current_group_col)
        .first(db_conn)
        .await?)
}

pub async fn current_group(
    requester: i32,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<Option<GroupSummary>> {
    let Some(group_id) = current_group_id(requester, db_conn).await? else {
        return Ok(None);
    };

    match GroupSummary::fetch_by_id(&group_id, db_conn).await {
        Ok(group) => Ok(Some(group)),
        Err(Error::RecordNotFound) => Ok(None),
        Err(err) => Err(err),
    }
}

#[derive(Serialize, Debug)]
pub struct MembershipSummary {
    pub id: i32,
    pub group_id: i32,
    pub member_id: i32,
    pub member_name: String,
    pub joined_at: DateTime<Utc>,
}

pub async fn current_group_members(
    requester: i32,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<Vec<MembershipSummary>> {
    let Some(group_id) = current_group_id(requester, db_conn).await? else {
        return Ok(Vec::new());
    };

    let rows: Vec<(i32, i32, i32, String, DateTime<Utc>)> = group_membership::table
        .inner_join(person::table)
        .filter(membership_group_col.eq(group_id))
        .order(joined_at_col.asc())
        .select((
            group_membership::id,
            membership_group_col,
            member_col,
            person_name_col,
            joined_at_col,
        ))
        .load(db_conn)
        .await?;

    Ok(rows
        .into_iter()
        .map(
            |(id, group_id, member_id, member_name, joined_at)| MembershipSummary {
                id,
                group_id,
                member_id,
                member_name,
                joined_at,
            },
        )
        .collect())
}
