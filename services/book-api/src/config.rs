//! サーバー設定
//!
//! 起動時に環境変数から一度だけ読み込む。
//! - DB_PATH: SQLiteデータベースファイルのパス（デフォルト: books.db）
//! - DB_POOL_SIZE: 読み取り用プールの最大接続数（デフォルト: 4）

use std::net::SocketAddr;

use thiserror::Error;

/// データベースパス環境変数名
pub const DB_PATH_ENV: &str = "DB_PATH";

/// 読み取りプールサイズ環境変数名
pub const DB_POOL_SIZE_ENV: &str = "DB_POOL_SIZE";

/// デフォルトのデータベースパス
const DEFAULT_DB_PATH: &str = "books.db";

/// デフォルトの読み取りプールサイズ
const DEFAULT_POOL_SIZE: usize = 4;

/// リッスンポート（固定）
const LISTEN_PORT: u16 = 8080;

/// 設定読み込みのエラー型
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {name}: {value:?}")]
    InvalidValue { name: String, value: String },
}

/// サーバー設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// データベースファイルのパス
    db_path: String,
    /// 読み取り用プールの最大接続数
    pool_size: usize,
}

impl ServerConfig {
    /// 環境変数から設定を読み込む
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// 任意の取得関数から設定を読み込む
    ///
    /// テストでプロセスの環境変数を書き換えずに済むよう、取得処理を外から渡せるようにしている。
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = lookup(DB_PATH_ENV)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let pool_size = match lookup(DB_POOL_SIZE_ENV) {
            None => DEFAULT_POOL_SIZE,
            Some(raw) => parse_pool_size(&raw)?,
        };

        Ok(Self { db_path, pool_size })
    }

    /// 明示的な値で設定を作成（テスト用）
    #[cfg(test)]
    pub fn new(db_path: impl Into<String>, pool_size: usize) -> Self {
        Self {
            db_path: db_path.into(),
            pool_size,
        }
    }

    /// データベースファイルのパスを取得
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// 読み取り用プールの最大接続数を取得
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// リッスンアドレスを取得（全インターフェースの固定ポート）
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], LISTEN_PORT))
    }
}

/// プールサイズを解析する（1以上の整数のみ許可）
fn parse_pool_size(raw: &str) -> Result<usize, ConfigError> {
    match raw.trim().parse::<usize>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(ConfigError::InvalidValue {
            name: DB_POOL_SIZE_ENV.to_string(),
            value: raw.to_string(),
        }),
    }
}
