use super::provider::{PurgeRequest, SURROGATE_CONTROL, SURROGATE_KEY, SurrogateProvider, required};
use crate::cache::config::CdnConfig;
use crate::cache::error::BuildError;

const DEFAULT_API_URL: &str = "https://api.fastly.com";
const KEY_HEADERS: [&str; 1] = [SURROGATE_KEY];
const CONTROL_HEADERS: [&str; 3] = ["Fastly-Cache-Control", SURROGATE_CONTROL, "Cache-Control"];

#[derive(Debug, Clone)]
pub struct Fastly {
    api_url: String,
    api_key: String,
    service_id: String,
    soft: bool,
}

impl Fastly {
    pub fn from_config(config: &CdnConfig) -> Result<Self, BuildError> {
        Ok(Self {
            api_url: config
                .api_url
                .as_deref()
                .unwrap_or(DEFAULT_API_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: required(&config.api_key, "fastly", "api_key")?.to_string(),
            service_id: required(&config.service_id, "fastly", "service_id")?.to_string(),
            soft: config.keep_stale(),
        })
    }
}

impl SurrogateProvider for Fastly {
    fn name(&self) -> &'static str {
        "fastly"
    }

    fn separator(&self) -> &'static str {
        " "
    }

    fn key_headers(&self) -> &[&'static str] {
        &KEY_HEADERS
    }

    fn control_headers(&self) -> &[&'static str] {
        &CONTROL_HEADERS
    }

    fn purge_requests(&self, tags: &[String]) -> Vec<PurgeRequest> {
        tags.iter()
            .map(|tag| {
                let url = format!(
                    "{}/service/{}/purge/{}",
                    self.api_url,
                    self.service_id,
                    url::form_urlencoded::byte_serialize(tag.as_bytes()).collect::<String>()
                );
                let request = PurgeRequest::post(url)
                    .header("Fastly-Key", self.api_key.as_str())
                    .header("Accept", "application/json");
                if self.soft {
                    request.header("Fastly-Soft-Purge", "1")
                } else {
                    request
                }
            })
            .collect()
    }
}
