//! Optional log analysis through a local Ollama server.
//!
//! When enabled in `config.json`, `/api/analyze-logs` sends an app's
//! captured log lines to the model and asks which line numbers carry the
//! actual failure. The whole feature is best-effort: any error just turns
//! analysis off for that request.

use std::time::Duration;

use anyhow::Context;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};

/// Hard deadline on the model call; a wedged local LLM must not wedge the
/// interstitial.
const ANALYZE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OllamaClient {
    url: String,
    model: String,
    client: Client<HttpConnector, Full<Bytes>>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaClient {
    pub fn new(url: &str, model: &str) -> Self {
        let url = if url.is_empty() {
            "http://localhost:11434".to_string()
        } else {
            url.trim_end_matches('/').to_string()
        };
        let model = if model.is_empty() {
            "llama3.2".to_string()
        } else {
            model.to_string()
        };
        Self {
            url,
            model,
            client: Client::builder(TokioExecutor::new()).build(HttpConnector::new()),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ask the model which log lines contain the failure. Returns 0-based
    /// indices into `logs`, already bounds-checked.
    pub async fn analyze_logs(&self, logs: &[String]) -> anyhow::Result<Vec<usize>> {
        if logs.is_empty() {
            return Ok(Vec::new());
        }

        let mut numbered = String::new();
        for (i, line) in logs.iter().enumerate() {
            numbered.push_str(&format!("{i}: {line}\n"));
        }

        let prompt = format!(
            "You are analyzing application logs to find error messages. \
             Below are numbered log lines.\n\n\
             Identify which line numbers contain the actual error or failure \
             message (not warnings, not info messages).\n\
             Return ONLY a comma-separated list of line numbers, nothing else. \
             If no clear errors, return \"none\".\n\n\
             Example response: \"5,6,7\" or \"12\" or \"none\"\n\n\
             Logs:\n{numbered}\nError line numbers:"
        );

        let body = serde_json::to_vec(&GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        })?;

        let request = Request::builder()
            .method("POST")
            .uri(format!("{}/api/generate", self.url))
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .context("building ollama request")?;

        let response = tokio::time::timeout(ANALYZE_TIMEOUT, self.client.request(request))
            .await
            .context("ollama request timed out")?
            .context("ollama request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("ollama returned status {}", response.status());
        }

        let body = response
            .into_body()
            .collect()
            .await
            .context("reading ollama response")?
            .to_bytes();
        let parsed: GenerateResponse =
            serde_json::from_slice(&body).context("decoding ollama response")?;

        Ok(parse_line_numbers(&parsed.response, logs.len()))
    }
}

/// Extract line numbers from the model's reply. Out-of-range values and
/// anything unparsable are ignored; "none" means no errors found.
fn parse_line_numbers(response: &str, max_lines: usize) -> Vec<usize> {
    let response = response.trim().to_ascii_lowercase();
    if response.is_empty() || response == "none" {
        return Vec::new();
    }

    response
        .split(',')
        .filter_map(|part| part.trim().parse::<usize>().ok())
        .filter(|&n| n < max_lines)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_numbers() {
        assert_eq!(parse_line_numbers("5,6,7", 10), vec![5, 6, 7]);
        assert_eq!(parse_line_numbers("12", 20), vec![12]);
        assert_eq!(parse_line_numbers(" 1 , 3 ", 10), vec![1, 3]);
    }

    #[test]
    fn none_and_empty_mean_no_errors() {
        assert!(parse_line_numbers("none", 10).is_empty());
        assert!(parse_line_numbers("NONE", 10).is_empty());
        assert!(parse_line_numbers("", 10).is_empty());
        assert!(parse_line_numbers("  \n", 10).is_empty());
    }

    #[test]
    fn out_of_range_and_garbage_are_dropped() {
        assert_eq!(parse_line_numbers("1,99,abc,3", 10), vec![1, 3]);
        assert!(parse_line_numbers("all of them", 10).is_empty());
    }

    #[test]
    fn defaults_fill_in_for_empty_settings() {
        let client = OllamaClient::new("", "");
        assert_eq!(client.url, "http://localhost:11434");
        assert_eq!(client.model(), "llama3.2");

        let client = OllamaClient::new("http://127.0.0.1:9999/", "mistral");
        assert_eq!(client.url, "http://127.0.0.1:9999");
        assert_eq!(client.model(), "mistral");
    }
}
