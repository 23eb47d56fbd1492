use diesel::{pg::Pg, prelude::*};
use diesel_async::RunQueryDsl;
use garde::Validate;
use serde::{Deserialize, Serialize};
use valuable::Valuable;

use crate::{
    db::model::{FetchById, Write},
    schema::person::{self, email as email_col, id as id_col, password_hash as password_hash_col},
};

/// Registration request. The credential itself never reaches the db layer;
/// the handler turns it into a [`NewPerson`] with the hash already computed.
#[derive(Deserialize, Validate, Valuable)]
#[garde(allow_unvalidated)]
pub struct Register {
    #[garde(email, length(max = 200))]
    pub email: String,
    #[garde(length(min = 6, max = 200))]
    #[valuable(skip)]
    pub password: String,
    #[garde(length(min = 1, max = 200))]
    pub name: Option<String>,
}

impl Register {
    #[must_use]
    pub fn display_name(&self) -> String {
        let Self { email, name, .. } = self;

        match name {
            Some(name) => name.clone(),
            None => email.split('@').next().unwrap_or("User").to_string(),
        }
    }
}

#[derive(Deserialize, Validate, Valuable)]
#[garde(allow_unvalidated)]
pub struct Credentials {
    #[garde(email)]
    pub email: String,
    #[garde(length(min = 1))]
    #[valuable(skip)]
    pub password: String,
}

#[derive(Insertable, Clone)]
#[diesel(table_name = person, check_for_backend(Pg))]
pub struct NewPerson {
    pub name: String,
    pub email: String,
    pub password_hash: String,
}

impl Write for NewPerson {
    type Returns = Person;

    async fn write(self, db_conn: &mut diesel_async::AsyncPgConnection) -> super::error::Result<Self::Returns> {
        Ok(diesel::insert_into(person::table)
            .values(&self)
            .returning(Person::as_returning())
            .get_result(db_conn)
            .await?)
    }
}

#[derive(Serialize, Queryable, Selectable, Clone, Debug)]
#[diesel(table_name = person, check_for_backend(Pg))]
pub struct Person {
    pub id: i32,
    pub name: String,
    pub email: String,
    pub current_group_id: Option<i32>,
}

impl FetchById for Person {
    type Id = i32;

    async fn fetch_by_id(
        id: &Self::Id,
        db_conn: &mut diesel_async::AsyncPgConnection,
    ) -> super::error::Result<Self> {
        Ok(person::table
            .filter(id_col.eq(id))
            .select(Self::as_select())
            .first(db_conn)
            .await?)
    }
}

/// Login lookup. An unknown email surfaces as `RecordNotFound`, which the
/// handler folds into the same response as a wrong password.
pub async fn fetch_login(
    email: &str,
    db_conn: &mut diesel_async::AsyncPgConnection,
) -> super::error::Result<(Person, String)> {
    Ok(person::table
        .filter(email_col.eq(email))
        .select((Person::as_select(), password_hash_col))
        .first(db_conn)
        .await?)
}

#[derive(Deserialize, Validate, Valuable, Default)]
#[garde(allow_unvalidated)]
pub struct ProfileUpdate {
    #[garde(length(min = 1, max = 200))]
    pub name: Option<String>,
    #[garde(email, length(max = 200))]
    pub email: Option<String>,
    #[garde(length(min = 6, max = 200))]
    #[valuable(skip)]
    pub password: Option<String>,
}

#[derive(AsChangeset, Default)]
#[diesel(table_name = person)]
pub struct PersonChanges {
    pub name: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
}

impl PersonChanges {
    pub async fn apply(
        self,
        requester: i32,
        db_conn: &mut diesel_async::AsyncPgConnection,
    ) -> super::error::Result<Person> {
        if let Self {
            name: None,
            email: None,
            password_hash: None,
        } = &self
        {
        } else {
            diesel::update(person::table.filter(id_col.eq(requester)))
                .set(&self)
                .execute(db_conn)
                .await?;
        }

        Person::fetch_by_id(&requester, db_conn).await
    }
}

#[cfg(test)]
mod tests {
    use diesel_async::{AsyncConnection, scoped_futures::ScopedFutureExt};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::db::{
        error::Error,
        test_util::{DbConnection, db_conn, new_person},
    };

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn duplicate_email_is_a_conflict(#[future] mut db_conn: DbConnection) {
        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let existing = new_person("morgan", conn).await;

                    let err = NewPerson {
                        name: "Morgan Again".to_string(),
                        email: existing.email.clone(),
                        password_hash: "irrelevant".to_string(),
                    }
                    .write(conn)
                    .await
                    .unwrap_err();

                    assert!(matches!(err, Error::DuplicateRecord { .. }), "{err:?}");

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn profile_update_is_partial(#[future] mut db_conn: DbConnection) {
        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let created = new_person("jamie", conn).await;

                    let updated = PersonChanges {
                        name: Some("Jamie Renamed".to_string()),
                        ..Default::default()
                    }
                    .apply(created.id, conn)
                    .await
                    .unwrap();

                    assert_eq!(updated.name, "Jamie Renamed");
                    assert_eq!(updated.email, created.email);

                    // All-None is a no-op, not an error
                    let unchanged = PersonChanges::default().apply(created.id, conn).await.unwrap();
                    assert_eq!(unchanged.name, "Jamie Renamed");

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }

    #[rstest]
    #[awt]
    #[tokio::test]
    async fn login_lookup_returns_stored_hash(#[future] mut db_conn: DbConnection) {
        db_conn
            .test_transaction::<_, Error, _>(|conn| {
                async move {
                    let created = new_person("casey", conn).await;

                    let (found, hash) = fetch_login(&created.email, conn).await.unwrap();
                    assert_eq!(found.id, created.id);
                    assert!(!hash.is_empty());

                    let err = fetch_login("nobody@example.org", conn).await.unwrap_err();
                    assert!(matches!(err, Error::RecordNotFound));

                    Ok(())
                }
                .scope_boxed()
            })
            .await;
    }
}
