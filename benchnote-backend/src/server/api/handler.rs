use axum::{
    Json,
    extract::{
        FromRequest, Multipart, Path, State,
        multipart::MultipartRejection,
        rejection::JsonRejection,
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use axum_extra::extract::{Query, QueryRejection};
use bytes::Bytes;
use diesel_async::{AsyncConnection, scoped_futures::ScopedFutureExt};
use garde::Validate;
use serde::{Deserialize, Serialize};
use valuable::Valuable;

use crate::{
    db::{
        self,
        model::{
            FetchById, Write,
            experiment::{
                self, ExperimentPatch, ExperimentPayload, NewExperiment, NewFile, NewLogEntry,
                Scope,
            },
            group::{self, GroupSummary, JoinRequest, MembershipSummary, NewGroup},
            person::{
                Credentials, NewPerson, Person, PersonChanges, ProfileUpdate, Register, fetch_login,
            },
        },
    },
    server::{
        AppState,
        auth::{self, BearerToken, User},
    },
    storage::FileStore,
};

use super::error::{Error, Result};

pub(super) struct ValidJson<T>(T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Validate,
    <T as Validate>::Context: std::default::Default,
{
    type Rejection = Error;

    async fn from_request(
        req: axum::extract::Request,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let axum::Json(data) = axum::Json::<T>::from_request(req, state).await?;
        data.validate()?;

        Ok(Self(data))
    }
}

impl<T: Serialize> IntoResponse for ValidJson<T> {
    fn into_response(self) -> Response {
        let Self(inner) = self;

        axum::Json(inner).into_response()
    }
}

#[derive(Serialize)]
pub(super) struct Message {
    message: &'static str,
}

#[derive(Serialize)]
pub(super) struct CreatedSession {
    user: Person,
    token: String,
}

pub(super) async fn register(
    State(app_state): State<AppState>,
    ValidJson(registration): ValidJson<Register>,
) -> Result<(StatusCode, Json<CreatedSession>)> {
    tracing::debug!(deserialized_registration = registration.as_value());

    let salt = app_state.session_salt().to_string();
    let mut db_conn = app_state.db_conn().await?;

    let name = registration.display_name();
    let Register {
        email, password, ..
    } = registration;

    let new_person = NewPerson {
        name,
        email,
        password_hash: auth::hash_password(&password),
    };

    let created = db_conn
        .transaction(|conn| {
            async move {
                let user = new_person.write(conn).await?;
                let token = auth::issue_session(user.id, &salt, conn).await?;

                Ok::<_, db::error::Error>(CreatedSession { user, token })
            }
            .scope_boxed()
        })
        .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

pub(super) async fn login(
    State(app_state): State<AppState>,
    ValidJson(credentials): ValidJson<Credentials>,
) -> Result<Json<CreatedSession>> {
    let salt = app_state.session_salt().to_string();
    let mut db_conn = app_state.db_conn().await?;

    let Credentials { email, password } = credentials;

    // Unknown email and wrong password collapse into the same response.
    let (user, stored_hash) = match fetch_login(&email, &mut db_conn).await {
        Ok(found) => found,
        Err(db::error::Error::RecordNotFound) => return Err(Error::InvalidCredentials),
        Err(err) => return Err(err.into()),
    };

    if !auth::verify_password(&password, &stored_hash) {
        return Err(Error::InvalidCredentials);
    }

    let user_id = user.id;
    let token = db_conn
        .transaction(|conn| async move { auth::issue_session(user_id, &salt, conn).await }.scope_boxed())
        .await?;

    Ok(Json(CreatedSession { user, token }))
}

pub(super) async fn logout(
    State(app_state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<Json<Message>> {
    let salt = app_state.session_salt().to_string();
    let mut db_conn = app_state.db_conn().await?;

    auth::revoke_session(&token, &salt, &mut db_conn).await?;

    Ok(Json(Message {
        message: "logged out",
    }))
}

pub(super) async fn me(
    User(user_id): User,
    State(app_state): State<AppState>,
) -> Result<Json<Person>> {
    let mut db_conn = app_state.db_conn().await?;

    let user = Person::fetch_by_id(&user_id, &mut db_conn).await?;

    Ok(Json(user))
}

pub(super) async fn update_me(
    User(user_id): User,
    State(app_state): State<AppState>,
    ValidJson(update): ValidJson<ProfileUpdate>,
) -> Result<Json<Person>> {
    tracing::debug!(deserialized_update = update.as_value());

    let mut db_conn = app_state.db_conn().await?;

    let ProfileUpdate {
        name,
        email,
        password,
    } = update;

    let changes = PersonChanges {
        name,
        email,
        password_hash: password.map(|p| auth::hash_password(&p)),
    };

    let user = db_conn
        .transaction(|conn| async move { changes.apply(user_id, conn).await }.scope_boxed())
        .await?;

    Ok(Json(user))
}

pub(super) async fn list_groups(
    User(user_id): User,
    State(app_state): State<AppState>,
) -> Result<Json<Vec<GroupSummary>>> {
    let mut db_conn = app_state.db_conn().await?;

    let groups = db_conn
        .transaction(|conn| async move { group::list_for_member(user_id, conn).await }.scope_boxed())
        .await?;

    Ok(Json(groups))
}

pub(super) async fn create_group(
    User(user_id): User,
    State(app_state): State<AppState>,
    ValidJson(new_group): ValidJson<NewGroup>,
) -> Result<(StatusCode, Json<GroupSummary>)> {
    tracing::debug!(deserialized_group = new_group.as_value());

    let max_code_attempts = app_state.config().group_code_attempts();
    let mut db_conn = app_state.db_conn().await?;

    let group = db_conn
        .transaction(|conn| {
            async move { new_group.create(user_id, max_code_attempts, conn).await }.scope_boxed()
        })
        .await?;

    Ok((StatusCode::CREATED, Json(group)))
}

pub(super) async fn join_group(
    User(user_id): User,
    State(app_state): State<AppState>,
    ValidJson(request): ValidJson<JoinRequest>,
) -> Result<Json<GroupSummary>> {
    tracing::debug!(deserialized_join = request.as_value());

    let code = group::normalize_join_code(&request.code);
    if !group::is_valid_join_code(&code) {
        return Err(Error::SimpleData {
            reason: "join codes are 6 alphanumeric characters".to_string(),
        });
    }

    let mut db_conn = app_state.db_conn().await?;

    let group = db_conn
        .transaction(|conn| async move { group::join_by_code(user_id, &code, conn).await }.scope_boxed())
        .await?;

    Ok(Json(group))
}

pub(super) async fn leave_group(
    User(user_id): User,
    State(app_state): State<AppState>,
    Path(group_id): Path<i32>,
) -> Result<Json<Message>> {
    let mut db_conn = app_state.db_conn().await?;

    db_conn
        .transaction(|conn| async move { group::leave(user_id, group_id, conn).await }.scope_boxed())
        .await?;

    Ok(Json(Message {
        message: "left group",
    }))
}

pub(super) async fn select_group(
    User(user_id): User,
    State(app_state): State<AppState>,
    Path(group_id): Path<i32>,
) -> Result<Json<GroupSummary>> {
    let mut db_conn = app_state.db_conn().await?;

    let selected = db_conn
        .transaction(|conn| async move { group::select(user_id, group_id, conn).await }.scope_boxed())
        .await;

    // The group exists whether or not the requester belongs to it, so a
    // missing membership is a Forbidden here, not a 404.
    match selected {
        Ok(group) => Ok(Json(group)),
        Err(db::error::Error::RecordNotFound) => Err(Error::Permission {
            message: "you are not a member of this group".to_string(),
        }),
        Err(err) => Err(err.into()),
    }
}

pub(super) async fn current_group(
    User(user_id): User,
    State(app_state): State<AppState>,
) -> Result<Json<Option<GroupSummary>>> {
    let mut db_conn = app_state.db_conn().await?;

    let group = db_conn
        .transaction(|conn| async move { group::current_group(user_id, conn).await }.scope_boxed())
        .await?;

    Ok(Json(group))
}

pub(super) async fn current_group_members(
    User(user_id): User,
    State(app_state): State<AppState>,
) -> Result<Json<Vec<MembershipSummary>>> {
    let mut db_conn = app_state.db_conn().await?;

    let members = db_conn
        .transaction(|conn| {
            async move { group::current_group_members(user_id, conn).await }.scope_boxed()
        })
        .await?;

    Ok(Json(members))
}

#[derive(Deserialize, Default)]
pub(super) struct ListParams {
    #[serde(default)]
    scope: Scope,
}

pub(super) async fn list_experiments(
    User(user_id): User,
    State(app_state): State<AppState>,
    params: std::result::Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<Vec<ExperimentPayload>>> {
    let Query(ListParams { scope }) = params?;
    tracing::debug!(deserialized_scope = scope.as_value());

    let mut db_conn = app_state.db_conn().await?;

    let experiments = db_conn
        .transaction(|conn| {
            async move { experiment::list_visible(user_id, scope, conn).await }.scope_boxed()
        })
        .await?;

    Ok(Json(experiments))
}

pub(super) async fn create_experiment(
    User(user_id): User,
    State(app_state): State<AppState>,
    ValidJson(new_experiment): ValidJson<NewExperiment>,
) -> Result<(StatusCode, Json<ExperimentPayload>)> {
    tracing::debug!(deserialized_experiment = new_experiment.as_value());

    let mut db_conn = app_state.db_conn().await?;

    let created = db_conn
        .transaction(|conn| async move { new_experiment.create(user_id, conn).await }.scope_boxed())
        .await?;

    Ok((StatusCode::CREATED, Json(created)))
}

fn ensure_external_id(exp_id: &str) -> Result<()> {
    if experiment::is_valid_external_id(exp_id) {
        Ok(())
    } else {
        Err(Error::SimpleData {
            reason: format!("invalid experiment id `{exp_id}`"),
        })
    }
}

pub(super) async fn get_experiment(
    User(user_id): User,
    State(app_state): State<AppState>,
    Path(exp_id): Path<String>,
) -> Result<Json<ExperimentPayload>> {
    ensure_external_id(&exp_id)?;

    let mut db_conn = app_state.db_conn().await?;

    let found = db_conn
        .transaction(|conn| {
            async move { experiment::fetch_visible(user_id, &exp_id, conn).await }.scope_boxed()
        })
        .await?;

    Ok(Json(found))
}

pub(super) async fn update_experiment(
    User(user_id): User,
    State(app_state): State<AppState>,
    Path(exp_id): Path<String>,
    ValidJson(patch): ValidJson<ExperimentPatch>,
) -> Result<Json<ExperimentPayload>> {
    ensure_external_id(&exp_id)?;
    tracing::debug!(deserialized_patch = patch.as_value());

    let mut db_conn = app_state.db_conn().await?;

    let updated = db_conn
        .transaction(|conn| {
            async move { patch.apply(user_id, &exp_id, conn).await }.scope_boxed()
        })
        .await?;

    Ok(Json(updated))
}

pub(super) async fn delete_experiment(
    User(user_id): User,
    State(app_state): State<AppState>,
    Path(exp_id): Path<String>,
) -> Result<Json<Message>> {
    ensure_external_id(&exp_id)?;

    let mut db_conn = app_state.db_conn().await?;

    let storage_keys = db_conn
        .transaction(|conn| {
            async move { experiment::delete(user_id, &exp_id, conn).await }.scope_boxed()
        })
        .await?;

    // Blobs go after the commit; a missing one is already gone.
    for key in storage_keys {
        if let Err(err) = app_state.file_store().remove(&key).await {
            tracing::warn!(storage_key = key, error = format!("{err:?}"), "failed to remove stored blob");
        }
    }

    Ok(Json(Message {
        message: "experiment deleted",
    }))
}

pub(super) async fn add_log(
    User(user_id): User,
    State(app_state): State<AppState>,
    Path(exp_id): Path<String>,
    ValidJson(entry): ValidJson<NewLogEntry>,
) -> Result<(StatusCode, Json<ExperimentPayload>)> {
    ensure_external_id(&exp_id)?;
    tracing::debug!(deserialized_log = entry.as_value());

    let mut db_conn = app_state.db_conn().await?;

    let updated = db_conn
        .transaction(|conn| {
            async move { experiment::add_log(user_id, &exp_id, entry, conn).await }.scope_boxed()
        })
        .await?;

    Ok((StatusCode::CREATED, Json(updated)))
}

pub(super) async fn attach_file(
    User(user_id): User,
    State(app_state): State<AppState>,
    Path(exp_id): Path<String>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<(StatusCode, Json<ExperimentPayload>)> {
    ensure_external_id(&exp_id)?;
    let mut multipart = multipart?;

    let mut db_conn = app_state.db_conn().await?;

    // Ownership gate first; co-members never get this far.
    let experiment_row = experiment::resolve_owned(user_id, &exp_id, &mut db_conn).await?;

    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field.file_name().unwrap_or_default().to_string();
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let contents = field.bytes().await?;

        upload = Some((original_name, mime_type, contents));
        break;
    }

    let Some((original_name, mime_type, contents)) = upload else {
        return Err(Error::MissingFile);
    };
    if original_name.is_empty() {
        return Err(Error::MissingFile);
    }

    let store = app_state.file_store();
    let storage_key = FileStore::generate_key(&original_name);
    store
        .save(&storage_key, &contents)
        .await
        .map_err(|err| Error::Storage {
            message: format!("{err:?}"),
        })?;

    let new_file = NewFile {
        experiment_id: experiment_row,
        original_name,
        storage_key: storage_key.clone(),
        byte_size: i64::try_from(contents.len()).unwrap_or(i64::MAX),
        mime_type,
    };

    let written = db_conn
        .transaction(|conn| async move { new_file.write(conn).await }.scope_boxed())
        .await;

    match written {
        Ok(payload) => Ok((StatusCode::CREATED, Json(payload))),
        Err(err) => {
            // Metadata write failed, so the blob has no owner; drop it.
            let _ = store.remove(&storage_key).await;
            Err(err.into())
        }
    }
}

pub(super) async fn delete_file(
    User(user_id): User,
    State(app_state): State<AppState>,
    Path((exp_id, file_id)): Path<(String, i32)>,
) -> Result<Json<ExperimentPayload>> {
    ensure_external_id(&exp_id)?;

    let mut db_conn = app_state.db_conn().await?;

    let (storage_key, payload) = db_conn
        .transaction(|conn| {
            async move { experiment::delete_file(user_id, &exp_id, file_id, conn).await }
                .scope_boxed()
        })
        .await?;

    if let Err(err) = app_state.file_store().remove(&storage_key).await {
        tracing::warn!(storage_key, error = format!("{err:?}"), "failed to remove stored blob");
    }

    Ok(Json(payload))
}

pub(super) async fn download_file(
    User(user_id): User,
    State(app_state): State<AppState>,
    Path((exp_id, file_id)): Path<(String, i32)>,
) -> Result<impl IntoResponse> {
    ensure_external_id(&exp_id)?;

    let mut db_conn = app_state.db_conn().await?;

    let file = experiment::file_for_download(user_id, &exp_id, file_id, &mut db_conn).await?;

    let contents = match app_state.file_store().read(&file.storage_key).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::Database(db::error::Error::RecordNotFound));
        }
        Err(err) => {
            return Err(Error::Storage {
                message: format!("{err:?}"),
            });
        }
    };

    // Clients see the original filename, never the storage key.
    let disposition = format!(
        "attachment; filename=\"{}\"",
        file.original_name.replace('"', "_")
    );

    let headers = [
        (header::CONTENT_TYPE, file.mime_type.clone()),
        (header::CONTENT_DISPOSITION, disposition),
    ];

    Ok((headers, Bytes::from(contents)))
}
