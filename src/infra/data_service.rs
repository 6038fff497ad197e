//! HTTP client for the data service.
//!
//! Every request goes through a [`SignalingTransport`], so signals on read
//! responses (and on any mutation issued via [`HttpDataService::execute`])
//! reach the invalidation manager.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Request, Response, Url};
use serde::Deserialize;

use crate::cache::{
    CacheKey, DetailKey, FetchError, InvalidationManager, PageSnapshot, PageSource,
    SignalingTransport, Transport,
};
use crate::domain::entities::{Collection, Entity};

use super::error::InfraError;

/// Plain reqwest transport.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(request_timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn user_agent() -> &'static str {
        concat!("boardsync/", env!("CARGO_PKG_VERSION"))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl Transport for HttpTransport {
    type Request = Request;
    type Response = Response;
    type Error = reqwest::Error;

    async fn send(&self, request: Request) -> Result<Response, reqwest::Error> {
        self.client.execute(request).await
    }
}

#[derive(Debug, Deserialize)]
struct PageBody {
    items: Vec<Entity>,
    total: u64,
}

/// Page source backed by the data service's read API.
pub struct HttpDataService {
    transport: SignalingTransport<HttpTransport>,
    base: Url,
}

impl HttpDataService {
    pub fn new(
        base: Url,
        request_timeout: Duration,
        manager: Arc<InvalidationManager>,
    ) -> Result<Self, InfraError> {
        let transport = SignalingTransport::new(HttpTransport::new(request_timeout)?, manager);
        Ok(Self { transport, base })
    }

    /// Send an arbitrary request (typically a mutation) through the signalling transport.
    pub async fn execute(&self, request: Request) -> Result<Response, reqwest::Error> {
        self.transport.send(request).await
    }

    pub fn client(&self) -> &Client {
        self.transport.inner().client()
    }

    /// `GET {base}/api/{resource}?page&limit[&board][&search]`
    pub fn page_url(&self, key: &CacheKey) -> Result<Url, FetchError> {
        let collection = key.collection();
        let filter = key.filter();
        let mut url = self.base.join(&format!("api/{}", collection.resource()))?;

        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("page", &filter.page().to_string());
            query.append_pair("limit", &filter.limit().to_string());
            if let Some(board) = collection.partition() {
                query.append_pair("board", board);
            }
            if let Some(search) = filter.search() {
                query.append_pair("search", search);
            }
        }
        Ok(url)
    }

    /// `GET {base}/api/{resource}/{id}[?board]`
    pub fn entity_url(&self, key: &DetailKey) -> Result<Url, FetchError> {
        let mut url = self.base.join(&format!("api/{}/", key.collection.resource()))?;
        url.path_segments_mut()
            .map_err(|()| {
                FetchError::Decode(format!("base url `{}` cannot hold a path", self.base))
            })?
            .pop_if_empty()
            .push(key.id.as_str());
        set_board(&mut url, &key.collection);
        Ok(url)
    }

    async fn get_json<T>(&self, url: Url) -> Result<T, FetchError>
    where
        T: for<'de> Deserialize<'de>,
    {
        let request = self
            .client()
            .get(url.clone())
            .build()
            .map_err(transport_error)?;
        let response = self.transport.send(request).await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let bytes = response.bytes().await.map_err(transport_error)?;
        serde_json::from_slice(&bytes).map_err(|err| FetchError::Decode(err.to_string()))
    }
}

#[async_trait]
impl PageSource for HttpDataService {
    async fn fetch_page(&self, key: &CacheKey) -> Result<PageSnapshot, FetchError> {
        let body: PageBody = self.get_json(self.page_url(key)?).await?;
        Ok(PageSnapshot {
            items: body.items,
            total: body.total,
        })
    }

    async fn fetch_entity(&self, key: &DetailKey) -> Result<Entity, FetchError> {
        self.get_json(self.entity_url(key)?).await
    }
}

fn set_board(url: &mut Url, collection: &Collection) {
    url.set_query(None);
    if let Some(board) = collection.partition() {
        url.query_pairs_mut().append_pair("board", board);
    }
}

fn transport_error(err: reqwest::Error) -> FetchError {
    FetchError::Transport(err.to_string())
}
