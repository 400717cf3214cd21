//! MongoDB document sink
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use mongodb::bson::{doc, Document as BsonDocument};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::{ClientOptions, ReplaceOptions};
use mongodb::{Client, Collection};
use tracing::{debug, error, info, warn};

use super::{DocumentSink, FailedDocument, WriteResult};
use crate::error::{Result, SinkError};
use crate::model::Document;

/// Server error codes for rejected credentials or missing privileges
const UNAUTHORIZED: i32 = 13;
const AUTHENTICATION_FAILED: i32 = 18;

/// How a driver error affects the batch being written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    /// Credentials or permissions; retrying cannot help
    Fatal,
    /// Server unreachable or pool reset; the whole call failed
    Connection,
    /// Only this document was rejected
    Document,
}

fn classify(err: &MongoError) -> Failure {
    match err.kind.as_ref() {
        ErrorKind::Authentication { .. } => Failure::Fatal,
        ErrorKind::Command(cmd) if matches!(cmd.code, UNAUTHORIZED | AUTHENTICATION_FAILED) => {
            Failure::Fatal
        }
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. } => Failure::Connection,
        _ if err.contains_label("RetryableWriteError") => Failure::Connection,
        _ => Failure::Document,
    }
}

/// Map a driver error from a whole-client call (connect, ping) onto the sink taxonomy
pub fn map_client_error(err: MongoError) -> SinkError {
    match classify(&err) {
        Failure::Fatal => SinkError::FatalConfig(err.to_string()),
        _ => SinkError::TransientConnection(err.to_string()),
    }
}

/// Create a pooled client and return it with the URL's default database, if any.
///
/// The client is cheap to clone and shared by every forwarder instance.
pub async fn connect(url: &str) -> Result<(Client, Option<String>)> {
    let mut options = ClientOptions::parse(url)
        .await
        .map_err(|e| SinkError::Config(format!("Invalid MONGODB_URL: {}", e)))?;
    options.app_name = Some("data-sink".to_string());

    let default_database = options.default_database.clone();
    let client = Client::with_options(options).map_err(map_client_error)?;

    Ok((client, default_database))
}

/// Round-trip to the server so bad credentials surface at startup
pub async fn ping(client: &Client, database: &str) -> Result<()> {
    client
        .database(database)
        .run_command(doc! { "ping": 1 }, None)
        .await
        .map_err(map_client_error)?;
    Ok(())
}

/// Upserts documents into one collection, `_id` = document id
#[derive(Clone)]
pub struct MongoSink {
    collection: Collection<BsonDocument>,
    concurrency: usize,
}

impl MongoSink {
    pub fn new(client: &Client, database: &str, collection: &str, concurrency: usize) -> Self {
        info!(
            database = %database,
            collection = %collection,
            concurrency,
            "MongoDB sink ready"
        );

        Self {
            collection: client.database(database).collection(collection),
            concurrency: concurrency.max(1),
        }
    }

    async fn upsert(&self, document: &Document) -> std::result::Result<(), (Failure, String)> {
        let replacement = document.to_bson().map_err(|e| (Failure::Document, e))?;

        let options = ReplaceOptions::builder().upsert(true).build();

        self.collection
            .replace_one(doc! { "_id": document.id.as_str() }, replacement, options)
            .await
            .map(|_| ())
            .map_err(|e| (classify(&e), e.to_string()))
    }
}

#[async_trait]
impl DocumentSink for MongoSink {
    async fn write(&self, documents: &[Document]) -> Result<WriteResult> {
        let upserts: Vec<_> = documents
            .iter()
            .map(|document| async move { (document, self.upsert(document).await) })
            .collect();
        let outcomes: Vec<_> = stream::iter(upserts)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut result = WriteResult::default();
        let mut connection_error = None;

        for (document, outcome) in outcomes {
            match outcome {
                Ok(()) => result.written += 1,
                Err((Failure::Fatal, message)) => {
                    error!(id = %document.id, error = %message, "MongoDB rejected credentials");
                    return Err(SinkError::FatalConfig(message));
                }
                Err((Failure::Connection, message)) => {
                    connection_error.get_or_insert_with(|| message.clone());
                    result.failed.push(FailedDocument {
                        id: document.id.clone(),
                        error: message,
                    });
                }
                Err((Failure::Document, message)) => {
                    warn!(id = %document.id, error = %message, "Document upsert failed");
                    result.failed.push(FailedDocument {
                        id: document.id.clone(),
                        error: message,
                    });
                }
            }
        }

        if let Some(message) = connection_error {
            warn!(
                failed = result.failed.len(),
                total = documents.len(),
                error = %message,
                "MongoDB connection error during batch write"
            );
            return Err(SinkError::TransientConnection(message));
        }

        debug!(
            written = result.written,
            failed = result.failed.len(),
            "Batch upserted to MongoDB"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;
    use crate::transform::{transform, DocumentIdStrategy};

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let err = connect("not-a-mongo-url").await.unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));
    }

    #[tokio::test]
    async fn test_default_database_from_url() {
        let (_client, database) = connect("mongodb://localhost:27017/shop").await.unwrap();
        assert_eq!(database.as_deref(), Some("shop"));
    }

    fn command_error(code: i32, code_name: &str) -> MongoError {
        let cmd: mongodb::error::CommandError = mongodb::bson::from_document(doc! {
            "code": code,
            "codeName": code_name,
            "errmsg": "rejected",
        })
        .unwrap();
        MongoError::from(ErrorKind::Command(cmd))
    }

    #[test]
    fn test_permission_codes_are_fatal() {
        assert_eq!(classify(&command_error(13, "Unauthorized")), Failure::Fatal);
        assert_eq!(classify(&command_error(18, "AuthenticationFailed")), Failure::Fatal);
        assert!(matches!(
            map_client_error(command_error(18, "AuthenticationFailed")),
            SinkError::FatalConfig(_)
        ));
    }

    #[test]
    fn test_other_command_errors_fail_the_document_only() {
        assert_eq!(classify(&command_error(11000, "DuplicateKey")), Failure::Document);
        assert_eq!(
            classify(&command_error(121, "DocumentValidationFailure")),
            Failure::Document
        );
    }

    #[test]
    fn test_io_errors_are_connection_failures() {
        let err = MongoError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ));
        assert_eq!(classify(&err), Failure::Connection);
        assert!(matches!(map_client_error(err), SinkError::TransientConnection(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let (client, _) = connect("mongodb://127.0.0.1:1/?serverSelectionTimeoutMS=100")
            .await
            .unwrap();

        let err = ping(&client, "data_sink_test").await.unwrap_err();
        assert!(err.is_transient(), "{:?}", err);
    }

    #[tokio::test]
    #[ignore] // Requires MongoDB at MONGODB_URL
    async fn test_upsert_is_idempotent() {
        let url = std::env::var("MONGODB_URL")
            .unwrap_or_else(|_| "mongodb://localhost:27017/".to_string());
        let (client, _) = connect(&url).await.unwrap();
        ping(&client, "data_sink_test").await.unwrap();

        let sink = MongoSink::new(&client, "data_sink_test", "upsert_idempotent", 4);
        let docs: Vec<Document> = (0..3)
            .map(|offset| {
                let record = Record::new("orders", 0, offset)
                    .with_value(format!(r#"{{"n":{}}}"#, offset).into_bytes());
                transform(&record, DocumentIdStrategy::Offset).unwrap()
            })
            .collect();

        assert_eq!(sink.write(&docs).await.unwrap().written, 3);
        assert_eq!(sink.write(&docs).await.unwrap().written, 3);

        let count = client
            .database("data_sink_test")
            .collection::<BsonDocument>("upsert_idempotent")
            .count_documents(None, None)
            .await
            .unwrap();
        assert_eq!(count, 3);

        client
            .database("data_sink_test")
            .drop(None)
            .await
            .unwrap();
    }
}
