//! GraphQL-queried, multi-gateway archive reads.
//!
//! One `reqwest::Client` shared across calls, a thin typed wrapper
//! around the wire format, errors folded into one adapter-local enum
//! before crossing back into `sharme-core`'s trait boundary.

use async_trait::async_trait;
use serde::Deserialize;
use sharme_core::error::{Result, SharmeError};
use sharme_core::gateway::{ArchiveGateway, QueryHit, Tags};
use thiserror::Error;
use tracing::{debug, warn};

const MAX_PAGES: usize = 1000;
const PAGE_SIZE: usize = 1000;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("gateway returned a GraphQL error: {0}")]
    GraphQl(String),
    #[error("all configured gateways failed; last error: {0}")]
    AllExhausted(String),
    #[error("blob exceeded {max} bytes (got {size})")]
    TooLarge { size: usize, max: usize },
}

impl From<GatewayError> for SharmeError {
    fn from(e: GatewayError) -> Self {
        SharmeError::GatewayError(e.to_string())
    }
}

/// Queries and downloads against an Arweave-shaped GraphQL index, with
/// ordered gateway failover.
pub struct ArweaveGateway {
    graphql_gateways: Vec<String>,
    data_gateways: Vec<String>,
    client: reqwest::Client,
}

impl ArweaveGateway {
    pub fn new(graphql_gateways: Vec<String>, data_gateways: Vec<String>) -> Self {
        Self {
            graphql_gateways,
            data_gateways,
            client: reqwest::Client::new(),
        }
    }

    async fn query_one_gateway(&self, gateway: &str, filter: &Tags) -> Result<Vec<QueryHit>> {
        let tag_filters: Vec<GqlTagFilter> = filter
            .iter()
            .map(|(name, value)| GqlTagFilter {
                name: name.clone(),
                values: vec![value.clone()],
            })
            .collect();

        let mut hits = Vec::new();
        let mut after: Option<String> = None;

        for page in 0..MAX_PAGES {
            let body = GqlRequest {
                query: TRANSACTIONS_QUERY,
                variables: GqlVariables {
                    tags: tag_filters.clone(),
                    after: after.clone(),
                    first: PAGE_SIZE as i64,
                },
            };

            let resp = self
                .client
                .post(gateway)
                .json(&body)
                .send()
                .await
                .map_err(|e| GatewayError::Request(e.to_string()))?;

            if !resp.status().is_success() {
                return Err(GatewayError::Request(format!(
                    "gateway returned status {}",
                    resp.status()
                ))
                .into());
            }

            let parsed: GqlResponse = resp
                .json()
                .await
                .map_err(|e| GatewayError::Request(e.to_string()))?;

            if let Some(errors) = parsed.errors {
                let joined = errors
                    .into_iter()
                    .map(|e| e.message)
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(GatewayError::GraphQl(joined).into());
            }

            let connection = parsed
                .data
                .and_then(|d| d.transactions)
                .ok_or_else(|| GatewayError::GraphQl("missing transactions field".into()))?;

            let has_next = connection.page_info.has_next_page;
            let edge_count = connection.edges.len();

            for edge in connection.edges {
                let tags: Tags = edge
                    .node
                    .tags
                    .into_iter()
                    .map(|t| (t.name, t.value))
                    .collect();
                hits.push(QueryHit {
                    tx_id: edge.node.id,
                    block_height: edge.node.block.map(|b| b.height).unwrap_or(0),
                    tags,
                });
                after = Some(edge.cursor);
            }

            if !has_next || edge_count == 0 {
                return Ok(dedupe_by_tx_id(hits));
            }

            if page == MAX_PAGES - 1 {
                return Err(SharmeError::PaginationBlown);
            }
        }

        Err(SharmeError::PaginationBlown)
    }
}

fn dedupe_by_tx_id(hits: Vec<QueryHit>) -> Vec<QueryHit> {
    let mut seen = std::collections::HashSet::new();
    let mut deduped: Vec<QueryHit> = hits
        .into_iter()
        .filter(|h| seen.insert(h.tx_id.clone()))
        .collect();
    deduped.sort_by_key(|h| h.block_height);
    deduped
}

#[async_trait]
impl ArchiveGateway for ArweaveGateway {
    async fn query_by_tags(&self, filter: &Tags) -> Result<Vec<QueryHit>> {
        let mut last_err = None;

        for gateway in &self.graphql_gateways {
            match self.query_one_gateway(gateway, filter).await {
                Ok(hits) => return Ok(hits),
                Err(SharmeError::PaginationBlown) => {
                    return Err(SharmeError::PaginationBlown);
                }
                Err(e) => {
                    warn!(gateway, error = %e, "archive query failed, trying next gateway");
                    last_err = Some(e.to_string());
                }
            }
        }

        Err(GatewayError::AllExhausted(last_err.unwrap_or_else(|| "no gateways configured".into()))
            .into())
    }

    async fn download(&self, tx_id: &str, max_bytes: usize) -> Result<Vec<u8>> {
        let mut last_err = None;

        for gateway in &self.data_gateways {
            let url = format!("{gateway}/{tx_id}");
            match self.download_one(&url, max_bytes).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    debug!(gateway, error = %e, "download failed, trying next gateway");
                    last_err = Some(e.to_string());
                }
            }
        }

        Err(GatewayError::AllExhausted(last_err.unwrap_or_else(|| "no gateways configured".into()))
            .into())
    }
}

impl ArweaveGateway {
    async fn download_one(&self, url: &str, max_bytes: usize) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(GatewayError::Request(format!(
                "gateway returned status {}",
                resp.status()
            ))
            .into());
        }

        if let Some(len) = resp.content_length() {
            if len as usize > max_bytes {
                return Err(GatewayError::TooLarge {
                    size: len as usize,
                    max: max_bytes,
                }
                .into());
            }
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        if bytes.len() > max_bytes {
            return Err(GatewayError::TooLarge {
                size: bytes.len(),
                max: max_bytes,
            }
            .into());
        }

        Ok(bytes.to_vec())
    }
}

const TRANSACTIONS_QUERY: &str = r#"
query($tags: [TagFilter!], $after: String, $first: Int) {
  transactions(tags: $tags, after: $after, first: $first, sort: HEIGHT_ASC) {
    pageInfo { hasNextPage }
    edges {
      cursor
      node {
        id
        block { height }
        tags { name value }
      }
    }
  }
}
"#;

#[derive(serde::Serialize, Clone)]
struct GqlTagFilter {
    name: String,
    values: Vec<String>,
}

#[derive(serde::Serialize)]
struct GqlVariables {
    tags: Vec<GqlTagFilter>,
    after: Option<String>,
    first: i64,
}

#[derive(serde::Serialize)]
struct GqlRequest {
    query: &'static str,
    variables: GqlVariables,
}

#[derive(Deserialize)]
struct GqlResponse {
    data: Option<GqlData>,
    errors: Option<Vec<GqlErrorEntry>>,
}

#[derive(Deserialize)]
struct GqlErrorEntry {
    message: String,
}

#[derive(Deserialize)]
struct GqlData {
    transactions: Option<GqlConnection>,
}

#[derive(Deserialize)]
struct GqlConnection {
    #[serde(rename = "pageInfo")]
    page_info: GqlPageInfo,
    edges: Vec<GqlEdge>,
}

#[derive(Deserialize)]
struct GqlPageInfo {
    #[serde(rename = "hasNextPage")]
    has_next_page: bool,
}

#[derive(Deserialize)]
struct GqlEdge {
    cursor: String,
    node: GqlNode,
}

#[derive(Deserialize)]
struct GqlNode {
    id: String,
    block: Option<GqlBlock>,
    tags: Vec<GqlTag>,
}

#[derive(Deserialize)]
struct GqlBlock {
    height: u64,
}

#[derive(Deserialize)]
struct GqlTag {
    name: String,
    value: String,
}
