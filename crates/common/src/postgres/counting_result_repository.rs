use crate::domain::{CountingResult, CountingResultRepository, DomainError, DomainResult};
use crate::postgres::PostgresClient;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};

const INSERT_COUNTING_RESULT: &str = "INSERT INTO counting_results
     (counter_id, count, producer, kernel, framework, message, received_at)
     VALUES ($1, $2, $3, $4, $5, $6, $7)";

/// PostgreSQL implementation of CountingResultRepository.
///
/// Every call appends a row; a counter reports many results over time so
/// there is no uniqueness on `counter_id`.
#[derive(Clone)]
pub struct PostgresCountingResultRepository {
    client: PostgresClient,
}

impl PostgresCountingResultRepository {
    pub fn new(client: PostgresClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CountingResultRepository for PostgresCountingResultRepository {
    #[instrument(skip(self, result), fields(counter_id = %result.id, count = result.count))]
    async fn save(&self, result: &CountingResult) -> DomainResult<()> {
        let conn = self
            .client
            .get_connection()
            .await
            .map_err(DomainError::RepositoryError)?;

        let received_at = Utc::now();

        conn.execute(
            INSERT_COUNTING_RESULT,
            &[
                &result.id,
                &result.count,
                &result.producer,
                &result.kernel,
                &result.framework,
                &result.message,
                &received_at,
            ],
        )
        .await
        .map_err(|e| DomainError::RepositoryError(e.into()))?;

        debug!(counter_id = %result.id, "Counting result inserted into database");

        Ok(())
    }
}
