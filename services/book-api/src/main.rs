//! 書籍レコードを管理するCRUD HTTP APIサーバー
//!
//! 本バイナリは以下の機能を提供する:
//! - 書籍の作成 (POST /api/create_books)
//! - 書籍の一覧 (GET /api/books)
//! - 書籍の取得 (GET /api/get_books/{id})
//! - 書籍の削除 (DELETE /api/delete_book/{id})
//! - ヘルスチェック (GET /health)

mod config;
mod error;
mod logging;
mod store;

use config::ServerConfig;
use error::ApiError;
use store::{BookStore, NewBook, SqliteBookStore};

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Serialize;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;

/// IDが空の場合のエラーメッセージ
const EMPTY_ID_MESSAGE: &str = "ID cannot be empty";

/// アプリケーション状態
///
/// ルーター全体で共有される状態を保持する。
#[derive(Clone)]
pub struct AppState {
    /// 書籍ストア
    pub store: Arc<dyn BookStore>,
}

/// メッセージのみのレスポンスボディ
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// メッセージとデータを含むレスポンスボディ
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DataResponse<T> {
    pub message: String,
    pub data: T,
}

/// パスパラメータを書籍IDに変換する
///
/// - 空文字列: 500 Internal Server Error
/// - 整数として解釈できない: 400 Bad Request（ストレージエラーと同じ扱い）
fn parse_book_id(raw: &str, failure_message: &str) -> Result<i64, ApiError> {
    if raw.is_empty() {
        tracing::warn!("IDが指定されていない");
        return Err(ApiError::internal_error(EMPTY_ID_MESSAGE));
    }

    raw.parse::<i64>().map_err(|e| {
        tracing::warn!(id = %raw, error = %e, "IDが整数ではない");
        ApiError::bad_request(failure_message)
    })
}

/// ヘルスチェックエンドポイント
async fn health() -> &'static str {
    "OK"
}

/// 書籍作成エンドポイント (POST /api/create_books)
///
/// # Returns
/// - 200 OK: 書籍が保存された
/// - 422 Unprocessable Entity: リクエストボディを解釈できない
/// - 400 Bad Request: データベースエラー
async fn create_book(
    State(state): State<AppState>,
    payload: Result<Json<NewBook>, JsonRejection>,
) -> Response {
    let Json(book) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            tracing::warn!(error = %rejection, "リクエストボディの解析に失敗");
            return ApiError::unprocessable_entity("Request failed").into_response();
        }
    };

    tracing::info!(
        author = %book.author,
        title = %book.title,
        publisher = %book.publisher,
        "書籍作成リクエストを受信"
    );

    match state.store.create_book(&book).await {
        Ok(created) => {
            tracing::info!(book_id = created.id, "書籍を作成");
            Json(MessageResponse::new("Book has been added")).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "書籍作成エラー");
            ApiError::bad_request("Could not create book").into_response()
        }
    }
}

/// 書籍一覧エンドポイント (GET /api/books)
///
/// # Returns
/// - 200 OK: 全書籍（ID昇順）
/// - 400 Bad Request: データベースエラー
async fn get_books(State(state): State<AppState>) -> Response {
    match state.store.list_books().await {
        Ok(books) => {
            tracing::info!(count = books.len(), "書籍一覧を返却");
            Json(DataResponse {
                message: "Books fetched successfully".to_string(),
                data: books,
            })
            .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "書籍一覧取得エラー");
            ApiError::bad_request("Books couldn't be fetched").into_response()
        }
    }
}

/// 書籍取得エンドポイント (GET /api/get_books/{id})
async fn get_book(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    get_book_by_id(&state, &id).await
}

/// IDが空の書籍取得 (GET /api/get_books/)
async fn get_book_without_id(State(state): State<AppState>) -> Response {
    get_book_by_id(&state, "").await
}

/// 書籍を1件取得する
///
/// # Returns
/// - 200 OK: 書籍
/// - 500 Internal Server Error: IDが空
/// - 400 Bad Request: 書籍が存在しない、IDが不正、またはデータベースエラー
async fn get_book_by_id(state: &AppState, raw_id: &str) -> Response {
    const FAILURE_MESSAGE: &str = "Could not get the book";

    let id = match parse_book_id(raw_id, FAILURE_MESSAGE) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    tracing::info!(book_id = id, "書籍取得リクエストを受信");

    match state.store.find_book(id).await {
        Ok(Some(book)) => Json(DataResponse {
            message: "Book fetched successfully".to_string(),
            data: book,
        })
        .into_response(),
        Ok(None) => {
            tracing::warn!(book_id = id, "書籍が見つからない");
            ApiError::bad_request(FAILURE_MESSAGE).into_response()
        }
        Err(e) => {
            tracing::error!(book_id = id, error = %e, "書籍取得エラー");
            ApiError::bad_request(FAILURE_MESSAGE).into_response()
        }
    }
}

/// 書籍削除エンドポイント (DELETE /api/delete_book/{id})
async fn delete_book(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    delete_book_by_id(&state, &id).await
}

/// IDが空の書籍削除 (DELETE /api/delete_book/)
async fn delete_book_without_id(State(state): State<AppState>) -> Response {
    delete_book_by_id(&state, "").await
}

/// 書籍を1件削除する
///
/// 対象が存在しなかった場合も200 OKを返す。
///
/// # Returns
/// - 200 OK: 削除処理が完了した
/// - 500 Internal Server Error: IDが空
/// - 400 Bad Request: IDが不正、またはデータベースエラー
async fn delete_book_by_id(state: &AppState, raw_id: &str) -> Response {
    const FAILURE_MESSAGE: &str = "Could not delete book";

    let id = match parse_book_id(raw_id, FAILURE_MESSAGE) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    tracing::info!(book_id = id, "書籍削除リクエストを受信");

    match state.store.delete_book(id).await {
        Ok(deleted) => {
            if deleted {
                tracing::info!(book_id = id, "書籍を削除");
            } else {
                tracing::info!(book_id = id, "削除対象の書籍は存在しなかった");
            }
            Json(MessageResponse::new("Deletion successful")).into_response()
        }
        Err(e) => {
            tracing::error!(book_id = id, error = %e, "書籍削除エラー");
            ApiError::bad_request(FAILURE_MESSAGE).into_response()
        }
    }
}

/// ルーターを構築する
///
/// IDなしのパス（末尾スラッシュのみ）も登録し、ルーターの404ではなく
/// ハンドラー側で500を返す。
/// TraceLayerによりリクエスト/レスポンスの構造化ログを自動記録する。
///
/// # Arguments
/// * `store` - 書籍ストア
pub fn create_router(store: Arc<dyn BookStore>) -> Router {
    let state = AppState { store };

    Router::new()
        .route("/health", get(health))
        .route("/api/create_books", post(create_book))
        .route("/api/delete_book/{id}", delete(delete_book))
        .route("/api/delete_book/", delete(delete_book_without_id))
        .route("/api/get_books/{id}", get(get_book))
        .route("/api/get_books/", get(get_book_without_id))
        .route("/api/books", get(get_books))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// シャットダウンシグナルを待機する
///
/// SIGTERMまたはCtrl+C (SIGINT) を受信したらリターンする。
/// シグナルハンドラーの登録に失敗した側は待機し続ける。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C シグナルハンドラーの登録に失敗");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM シグナルハンドラーの登録に失敗");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C (SIGINT) を受信しました。graceful shutdownを開始します");
        }
        _ = terminate => {
            tracing::info!("SIGTERM を受信しました。graceful shutdownを開始します");
        }
    }
}

/// メイン関数
///
/// 設定・ストアの初期化に失敗した場合はリクエストを受け付ける前に終了する。
///
/// # 環境変数
/// - `DB_PATH`: データベースファイルのパス（デフォルト: books.db）
/// - `DB_POOL_SIZE`: 読み取り用プールの最大接続数（デフォルト: 4）
/// - `RUST_LOG`: ログレベル（デフォルト: info）
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    tracing::info!("書籍APIサーバーを起動します");

    let config = ServerConfig::from_env()
        .inspect_err(|e| tracing::error!(error = %e, "設定の読み込みに失敗"))?;
    tracing::info!(
        db_path = %config.db_path(),
        pool_size = config.pool_size(),
        "設定を読み込みました"
    );

    let store = SqliteBookStore::new(config.db_path(), config.pool_size())
        .await
        .inspect_err(|e| tracing::error!(error = %e, "SQLiteストアの初期化に失敗"))?;
    tracing::info!("SQLiteストアを初期化しました");

    let app = create_router(Arc::new(store));

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .inspect_err(|e| tracing::error!(%addr, error = %e, "アドレスのバインドに失敗"))?;
    tracing::info!(%addr, "リッスン開始");

    // シグナル受信後は新規接続を止め、処理中のリクエスト完了を待ってからストアをドロップする
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("サーバーが正常に停止しました");
    Ok(())
}



#[cfg(test)]
mod graceful_shutdown_tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::oneshot;

    /// graceful shutdownを使用したサーバーが正常に起動・停止できることを確認
    #[tokio::test]
    async fn test_server_with_graceful_shutdown_starts_and_stops() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db").to_string_lossy().to_string();
        let store = Arc::new(SqliteBookStore::new(&db_path, 4).await.unwrap());
        let app = create_router(store);

        // ランダムポートでリッスン
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server_handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("サーバーの起動に失敗");
        });

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{}/api/books", addr))
            .send()
            .await
            .expect("書籍一覧リクエストに失敗");
        assert_eq!(response.status(), 200);

        shutdown_tx.send(()).expect("シャットダウンシグナル送信に失敗");

        let shutdown_result = tokio::time::timeout(Duration::from_secs(5), server_handle).await;
        assert!(shutdown_result.is_ok(), "サーバーが5秒以内に停止しなかった");
        assert!(shutdown_result.unwrap().is_ok(), "サーバーがエラーで停止した");

        drop(dir);
    }
}
