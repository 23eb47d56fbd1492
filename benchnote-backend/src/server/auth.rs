use argon2::{
    Argon2, PasswordHash, PasswordVerifier,
    password_hash::{PasswordHasher, SaltString},
};
use axum::{
    RequestPartsExt,
    extract::FromRequestParts,
    response::IntoResponse,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use rand::{TryRngCore, rngs::OsRng};
use serde::Serialize;
use uuid::Uuid;
use valuable::Valuable;

use crate::{
    db,
    schema::session::{self, token_hash as token_hash_col, user_id as user_id_col},
};

use super::AppState;

pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; 16];
    OsRng.try_fill_bytes(&mut salt).unwrap();

    let salt = SaltString::encode_b64(&salt).unwrap();

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .unwrap()
        .to_string()
}

#[must_use]
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(stored_hash) else {
        return false;
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

// Session tokens are hashed with a fixed, configured salt so lookup can be
// a plain equality filter.
fn hash_session_token(token: &Uuid, salt: &str) -> String {
    let salt = SaltString::from_b64(salt).unwrap();

    Argon2::default()
        .hash_password(token.as_bytes(), &salt)
        .unwrap()
        .to_string()
}

/// Mints a session row for the user and hands back the opaque bearer token.
///
/// # Errors
pub async fn issue_session(
    user_id: i32,
    salt: &str,
    db_conn: &mut AsyncPgConnection,
) -> db::error::Result<String> {
    let token = Uuid::new_v4();

    diesel::insert_into(session::table)
        .values((
            token_hash_col.eq(hash_session_token(&token, salt)),
            user_id_col.eq(user_id),
        ))
        .execute(db_conn)
        .await?;

    Ok(token.to_string())
}

/// Deletes the session row; revoking a token that is already gone is fine.
///
/// # Errors
pub async fn revoke_session(
    token: &Uuid,
    salt: &str,
    db_conn: &mut AsyncPgConnection,
) -> db::error::Result<()> {
    diesel::delete(session::table.filter(token_hash_col.eq(hash_session_token(token, salt))))
        .execute(db_conn)
        .await?;

    Ok(())
}

/// The authenticated requester. Every core operation takes this id as
/// explicit context; nothing downstream reads ambient session state.
#[derive(Clone, Copy, Valuable)]
pub struct User(pub i32);

impl User {
    async fn fetch_by_session_token(
        token: &Uuid,
        salt: &str,
        db_conn: &mut AsyncPgConnection,
    ) -> db::error::Result<Self> {
        let user_id = session::table
            .filter(token_hash_col.eq(hash_session_token(token, salt)))
            .select(user_id_col)
            .first(db_conn)
            .await?;

        Ok(Self(user_id))
    }
}

pub(super) struct BearerToken(pub(super) Uuid);

impl<S> FromRequestParts<S> for BearerToken
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| Error::TokenNotFound)?;

        let token = Uuid::parse_str(bearer.token()).map_err(|_| Error::InvalidSessionToken)?;

        Ok(Self(token))
    }
}

impl FromRequestParts<AppState> for User {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        app_state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let BearerToken(token) = parts.extract::<BearerToken>().await?;

        let mut db_conn = app_state.db_conn().await?;

        let user =
            Self::fetch_by_session_token(&token, app_state.session_salt(), &mut db_conn).await?;

        Ok(user)
    }
}

#[derive(thiserror::Error, Serialize, Debug, Clone, Valuable)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Error {
    #[error("session token not found in request headers")]
    TokenNotFound,
    #[error("invalid session token")]
    InvalidSessionToken,
    #[error(transparent)]
    Other(db::error::Error),
}

impl From<db::error::Error> for Error {
    fn from(err: db::error::Error) -> Self {
        use db::error::Error::RecordNotFound;

        match err {
            RecordNotFound => Self::InvalidSessionToken,
            _ => Self::Other(err),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        tracing::error!(auth_error = self.as_value());

        #[derive(Serialize)]
        struct ErrorResponse {
            status: u16,
            error: Option<Error>,
        }

        match self {
            Self::TokenNotFound | Self::InvalidSessionToken => (
                StatusCode::UNAUTHORIZED,
                axum::Json(ErrorResponse {
                    status: StatusCode::UNAUTHORIZED.as_u16(),
                    error: Some(self),
                }),
            )
                .into_response(),
            Self::Other(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(ErrorResponse {
                    status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    error: None,
                }),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn password_hashes_verify_and_are_salted() {
        let first = hash_password("correct horse battery staple");
        let second = hash_password("correct horse battery staple");

        assert_ne!(first, second);
        assert!(verify_password("correct horse battery staple", &first));
        assert!(!verify_password("wrong password", &first));
        assert!(!verify_password("anything", "not a phc string"));
    }

    #[test]
    fn session_token_hashing_is_deterministic_per_salt() {
        let token = Uuid::new_v4();
        let salt = "YmVuY2hub3RlLXNlc3Npb25z";

        assert_eq!(
            hash_session_token(&token, salt),
            hash_session_token(&token, salt)
        );
        assert_ne!(
            hash_session_token(&token, salt),
            hash_session_token(&Uuid::new_v4(), salt)
        );
    }
}
