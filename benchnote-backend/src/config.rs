use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser};

use crate::db::model::group::DEFAULT_JOIN_CODE_ATTEMPTS;

#[derive(Args, serde::Deserialize, Clone)]
pub struct Config {
    #[arg(long, default_value_t)]
    dev: bool,
    #[arg(long, env = "BENCHNOTE_DB_USER", default_value_t = String::from("postgres"))]
    db_user: String,
    #[arg(long, env = "BENCHNOTE_DB_PASSWORD", default_value_t)]
    db_password: String,
    #[arg(long, env = "BENCHNOTE_DB_HOST", default_value_t = String::from("localhost"))]
    db_host: String,
    #[arg(long, env = "BENCHNOTE_DB_PORT", default_value_t = 5432)]
    db_port: u16,
    #[arg(long, env = "BENCHNOTE_DB_NAME", default_value_t = String::from("benchnote"))]
    db_name: String,
    #[arg(long, env = "BENCHNOTE_HOST", default_value_t = String::from("localhost"))]
    host: String,
    #[arg(long, env = "BENCHNOTE_PORT", default_value_t = 8000)]
    port: u16,
    #[arg(long, env = "BENCHNOTE_UPLOAD_DIR", default_value_t = Utf8PathBuf::from("uploads"))]
    upload_dir: Utf8PathBuf,
    // Must be valid unpadded base64; it salts session-token hashes, so
    // changing it invalidates every live session.
    #[arg(long, env = "BENCHNOTE_SESSION_SALT", default_value_t = String::from("YmVuY2hub3RlLXNlc3Npb25z"))]
    session_salt: String,
    #[arg(long, env = "BENCHNOTE_GROUP_CODE_ATTEMPTS", default_value_t = DEFAULT_JOIN_CODE_ATTEMPTS)]
    group_code_attempts: u32,
}

impl Config {
    #[must_use]
    pub fn is_dev(&self) -> bool {
        self.dev
    }

    #[must_use]
    pub fn app_address(&self) -> String {
        let Self { host, port, .. } = self;

        format!("{host}:{port}")
    }

    #[must_use]
    pub fn db_url(&self) -> String {
        let Self {
            db_user,
            db_password,
            db_host,
            db_port,
            db_name,
            ..
        } = self;

        format!("postgres://{db_user}:{db_password}@{db_host}:{db_port}/{db_name}")
    }

    #[must_use]
    pub fn upload_dir(&self) -> &Utf8Path {
        &self.upload_dir
    }

    #[must_use]
    pub fn session_salt(&self) -> &str {
        &self.session_salt
    }

    #[must_use]
    pub fn group_code_attempts(&self) -> u32 {
        self.group_code_attempts
    }
}

#[derive(Parser)]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,
    #[arg(long, env = "BENCHNOTE_LOG_DIR")]
    pub log_dir: Option<Utf8PathBuf>,
}
