use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{Queries, SearchHit};

/// Text generation backend.
pub trait GenerationService: Send + Sync + 'static {
    /// Send one system instruction and one user message, return the reply text.
    fn invoke<'a>(&'a self, system: &'a str, user: &'a str) -> BoxFuture<'a, Result<String>>;

    /// Same call in structured-output mode. The reply must be JSON conforming
    /// to `schema`; callers validate it before use.
    fn invoke_structured<'a>(
        &'a self,
        system: &'a str,
        user: &'a str,
        schema: &'a serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value>>;
}

/// Web search backend.
pub trait SearchService: Send + Sync + 'static {
    fn search<'a>(&'a self, query: &'a str, max_results: usize)
        -> BoxFuture<'a, Result<Vec<SearchHit>>>;
}

/// Ask the generation service for search queries and validate the reply.
pub async fn request_queries(
    generation: &dyn GenerationService,
    system: &str,
    user: &str,
) -> Result<Queries> {
    let schema = Queries::schema();
    let value = generation.invoke_structured(system, user, &schema).await?;
    Queries::from_value(&value)
}
