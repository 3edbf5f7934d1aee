//! SQLite書籍ストア
//!
//! 書籍レコードの作成・一覧・取得・削除機能を提供する。
//! - 書き込み: 専用の単一接続（Arc<Mutex<Connection>>）
//! - 読み取り: deadpool-sqliteによるasync接続プール

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use deadpool_sqlite::{Config, Pool, Runtime};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::de::{self, Deserializer, IgnoredAny, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ストアエラー
#[derive(Debug, Error)]
pub enum StoreError {
    /// データベースエラー
    #[error("データベースエラー: {0}")]
    Database(String),

    /// プール取得エラー
    #[error("プールエラー: {0}")]
    Pool(String),

    /// 接続構築エラー
    #[error("接続構築エラー: {0}")]
    Build(String),

    /// ブロッキングタスクの実行エラー
    #[error("タスク実行エラー: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<deadpool_sqlite::BuildError> for StoreError {
    fn from(err: deadpool_sqlite::BuildError) -> Self {
        StoreError::Build(err.to_string())
    }
}

impl From<deadpool_sqlite::PoolError> for StoreError {
    fn from(err: deadpool_sqlite::PoolError) -> Self {
        StoreError::Pool(err.to_string())
    }
}

impl From<deadpool_sqlite::InteractError> for StoreError {
    fn from(err: deadpool_sqlite::InteractError) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Task(err.to_string())
    }
}

/// 書籍作成リクエスト
///
/// - 存在しないフィールド、`null`のフィールドは空文字列として扱う
/// - ボディ全体が`null`の場合は全フィールドが空文字列になる
/// - キーは大文字小文字を区別しない（`"Author"`も`author`として読む）
/// - 未知のキーは無視する。文字列以外の値はエラー
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewBook {
    /// 著者
    pub author: String,
    /// タイトル
    pub title: String,
    /// 出版社
    pub publisher: String,
}

impl<'de> Deserialize<'de> for NewBook {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(NewBookVisitor)
    }
}

/// NewBookのデシリアライズ用Visitor
struct NewBookVisitor;

impl<'de> Visitor<'de> for NewBookVisitor {
    type Value = NewBook;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a book object or null")
    }

    fn visit_unit<E>(self) -> Result<NewBook, E>
    where
        E: de::Error,
    {
        Ok(NewBook::default())
    }

    fn visit_map<A>(self, mut map: A) -> Result<NewBook, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut book = NewBook::default();

        // 同じフィールドが複数回現れた場合は後勝ち
        while let Some(key) = map.next_key::<String>()? {
            let field = match key.to_lowercase().as_str() {
                "author" => &mut book.author,
                "title" => &mut book.title,
                "publisher" => &mut book.publisher,
                _ => {
                    map.next_value::<IgnoredAny>()?;
                    continue;
                }
            };
            if let Some(value) = map.next_value::<Option<String>>()? {
                *field = value;
            }
        }

        Ok(book)
    }
}

/// 永続化された書籍
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Book {
    /// ストレージ層が採番するID（一度割り当てたら不変）
    pub id: i64,
    /// 著者
    pub author: String,
    /// タイトル
    pub title: String,
    /// 出版社
    pub publisher: String,
}

/// 書籍ストレージ
///
/// ハンドラーはこのトレイト越しにのみ永続化を行う。
/// テストでは失敗する実装などに差し替えられる。
#[async_trait]
pub trait BookStore: Send + Sync {
    /// 書籍を1件保存し、採番されたIDを含むレコードを返す
    async fn create_book(&self, book: &NewBook) -> Result<Book, StoreError>;

    /// 全書籍をID昇順で返す
    async fn list_books(&self) -> Result<Vec<Book>, StoreError>;

    /// IDで書籍を1件取得する
    ///
    /// # Returns
    /// * `Ok(Some(Book))` - 見つかった
    /// * `Ok(None)` - 存在しない
    async fn find_book(&self, id: i64) -> Result<Option<Book>, StoreError>;

    /// IDで書籍を削除する
    ///
    /// # Returns
    /// * `Ok(true)` - 削除した
    /// * `Ok(false)` - 該当する書籍が存在しなかった
    async fn delete_book(&self, id: i64) -> Result<bool, StoreError>;
}

/// SQLiteデータベースのスキーマを定義するSQL
const SCHEMA_SQL: &str = r#"
-- WALモード設定
PRAGMA journal_mode=WAL;
PRAGMA synchronous=NORMAL;

-- 書籍テーブル
-- AUTOINCREMENTにより削除済みIDは再利用されない
CREATE TABLE IF NOT EXISTS books (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    author TEXT NOT NULL,
    title TEXT NOT NULL,
    publisher TEXT NOT NULL
);
"#;

/// 書籍を取得するSELECT句（列順はbook_from_rowと一致させる）
const SELECT_BOOK_SQL: &str = "SELECT id, author, title, publisher FROM books";

/// SQLite書籍ストア
///
/// - 書き込み: 専用の単一接続（Arc<Mutex<Connection>>）
/// - 読み取り: deadpool-sqliteによるasync接続プール
pub struct SqliteBookStore {
    /// 書き込み専用接続
    write_conn: Arc<Mutex<Connection>>,
    /// 読み取り用async接続プール
    read_pool: Pool,
}

impl SqliteBookStore {
    /// 新しいSqliteBookStoreを作成
    ///
    /// データベースファイルを開き（存在しなければ作成し）、スキーマを初期化する。
    ///
    /// # Arguments
    /// * `db_path` - データベースファイルのパス
    /// * `pool_size` - 読み取り用プールの最大接続数
    pub async fn new(db_path: &str, pool_size: usize) -> Result<Self, StoreError> {
        let write_conn = Connection::open(db_path)?;
        write_conn.execute_batch(SCHEMA_SQL)?;

        let read_pool = Config::new(db_path)
            .builder(Runtime::Tokio1)
            .map_err(|e| StoreError::Build(e.to_string()))?
            .max_size(pool_size)
            .build()?;

        tracing::debug!(db_path = %db_path, pool_size, "SQLiteストアを開きました");

        Ok(Self {
            write_conn: Arc::new(Mutex::new(write_conn)),
            read_pool,
        })
    }

    /// 書き込み用接続上でクロージャを実行する（内部用）
    ///
    /// rusqliteはブロッキングAPIのため、spawn_blocking上でロックを取得して実行する。
    async fn with_write_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.write_conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| {
                StoreError::Database("書き込み接続のロック取得に失敗（Mutex poisoned）".to_string())
            })?;
            f(&conn)
        })
        .await?
    }
}

/// 行をBookに変換する
fn book_from_row(row: &Row<'_>) -> rusqlite::Result<Book> {
    Ok(Book {
        id: row.get(0)?,
        author: row.get(1)?,
        title: row.get(2)?,
        publisher: row.get(3)?,
    })
}

#[async_trait]
impl BookStore for SqliteBookStore {
    async fn create_book(&self, book: &NewBook) -> Result<Book, StoreError> {
        let book = book.clone();

        self.with_write_conn(move |conn| {
            conn.execute(
                "INSERT INTO books (author, title, publisher) VALUES (?1, ?2, ?3)",
                rusqlite::params![&book.author, &book.title, &book.publisher],
            )?;

            Ok(Book {
                id: conn.last_insert_rowid(),
                author: book.author,
                title: book.title,
                publisher: book.publisher,
            })
        })
        .await
    }

    async fn list_books(&self) -> Result<Vec<Book>, StoreError> {
        let conn = self.read_pool.get().await?;

        conn.interact(|conn| -> Result<Vec<Book>, StoreError> {
            let mut stmt = conn.prepare(&format!("{} ORDER BY id ASC", SELECT_BOOK_SQL))?;
            let books = stmt
                .query_map([], book_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(books)
        })
        .await?
    }

    async fn find_book(&self, id: i64) -> Result<Option<Book>, StoreError> {
        let conn = self.read_pool.get().await?;

        conn.interact(move |conn| -> Result<Option<Book>, StoreError> {
            let book = conn
                .query_row(
                    &format!("{} WHERE id = ?1", SELECT_BOOK_SQL),
                    [id],
                    book_from_row,
                )
                .optional()?;
            Ok(book)
        })
        .await?
    }

    async fn delete_book(&self, id: i64) -> Result<bool, StoreError> {
        self.with_write_conn(move |conn| {
            let rows_affected = conn.execute("DELETE FROM books WHERE id = ?1", [id])?;
            Ok(rows_affected > 0)
        })
        .await
    }
}
