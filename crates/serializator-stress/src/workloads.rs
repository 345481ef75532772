use std::sync::Arc;

use serde::Deserialize;

use serializator_service::caching::{CacheEntry, CacheError, Serializator};
use serializator_service::test::Student;

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize)]
pub struct Workload {
    pub concurrency: usize,
    pub key: String,
    pub operation: Operation,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Serialize,
    Deserialize,
    Get,
}

/// The object written for `key`.
///
/// Each write uses a different `age`, so concurrent writers of one key produce different files.
pub fn student(key: &str, round: usize) -> Student {
    Student {
        surname: "Stress".into(),
        average_mark: 'B',
        scholarship: round % 2 == 0,
        ..Student::new(key, (round % 100) as i32)
    }
}

/// Runs a single operation of `workload`.
pub async fn process_workload(
    serializator: &Arc<Serializator<Student>>,
    key: &str,
    operation: Operation,
    round: usize,
) -> CacheEntry {
    match operation {
        Operation::Serialize => {
            let written = serializator.serialize(student(key, round), key).await?;
            if !written {
                return Err(CacheError::Shutdown);
            }
        }
        Operation::Deserialize => {
            serializator.deserialize(key).await?;
        }
        Operation::Get => {
            // `get` blocks the calling thread until the object is available.
            let serializator = Arc::clone(serializator);
            let key = key.to_owned();
            tokio::task::spawn_blocking(move || serializator.get(&key))
                .await
                .map_err(|_| CacheError::InternalError)??;
        }
    }
    Ok(())
}
