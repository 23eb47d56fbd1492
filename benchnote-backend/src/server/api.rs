use axum::{
    Router,
    routing::{delete, get, post},
};

use super::AppState;

mod error;
mod handler;

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(|| async {}))
        .route("/register", post(handler::register))
        .route("/login", post(handler::login))
        .route("/logout", post(handler::logout))
        .route("/me", get(handler::me).put(handler::update_me))
        .route("/groups", get(handler::list_groups).post(handler::create_group))
        .route("/groups/join", post(handler::join_group))
        .route("/groups/{group_id}/leave", post(handler::leave_group))
        .route("/groups/{group_id}/select", post(handler::select_group))
        .route("/groups/current", get(handler::current_group))
        .route("/groups/current/members", get(handler::current_group_members))
        .route(
            "/experiments",
            get(handler::list_experiments).post(handler::create_experiment),
        )
        .route(
            "/experiments/{exp_id}",
            get(handler::get_experiment)
                .put(handler::update_experiment)
                .delete(handler::delete_experiment),
        )
        .route("/experiments/{exp_id}/logs", post(handler::add_log))
        .route("/experiments/{exp_id}/files", post(handler::attach_file))
        .route(
            "/experiments/{exp_id}/files/{file_id}",
            delete(handler::delete_file),
        )
        .route(
            "/experiments/{exp_id}/files/{file_id}/download",
            get(handler::download_file),
        )
}
