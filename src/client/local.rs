//! In-process transport: hands blobs straight to a [`Worker`].

use async_trait::async_trait;
use futures::StreamExt;

use super::{ReplyStream, Transport, TransportError};
use crate::security::EncryptedBlob;
use crate::worker::{Job, Worker};

#[derive(Debug, Clone)]
pub struct LocalTransport {
    worker: Worker,
}

impl LocalTransport {
    pub fn new(worker: Worker) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn submit(&self, blob: EncryptedBlob) -> Result<ReplyStream, TransportError> {
        let job = Job::new(uuid::Uuid::new_v4().to_string(), blob);
        Ok(self
            .worker
            .handle(job)
            .map(|item| Ok(item.into_chunk()))
            .boxed())
    }
}
