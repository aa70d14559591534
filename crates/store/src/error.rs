use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("failed to create store directory at {path}"))]
    CreateStoreDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to read store blob '{key}'"))]
    ReadBlob {
        stage: &'static str,
        key: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write store blob '{key}'"))]
    WriteBlob {
        stage: &'static str,
        key: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize thread records"))]
    SerializeThreads {
        stage: &'static str,
        source: serde_json::Error,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;
