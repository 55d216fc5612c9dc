use anyhow::anyhow;
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Error envelope
//
// Failed requests answer with a list of errors instead of the resource:
//
//   [{"error": {"type": 1, "address": "/sensors", "description": "unauthorized user"}}]
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ErrorEntry {
    pub error: ApiError,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type")]
    pub code: i64,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub description: String,
}

/// Maps an error envelope in `body` to an error; any other body passes.
pub fn check_api_error(body: &[u8]) -> anyhow::Result<()> {
    match serde_json::from_slice::<Vec<ErrorEntry>>(body) {
        Ok(entries) => match entries.first() {
            Some(ErrorEntry { error }) => Err(anyhow!(
                "deCONZ API error: type={}, address={}, description={}",
                error.code,
                error.address,
                error.description
            )),
            None => Ok(()),
        },
        Err(_) => Ok(()),
    }
}
