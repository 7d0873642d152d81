// Envelope parsing - splits a raw message into api key, log type and payload
//
// Wire format (one per line on TCP, one per body on HTTP):
//   apiKey@logType Some text
//   apiKey@logType {"message": "Some text", "field": "value"}

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub api_key: &'a str,
    pub log_type: &'a str,
    pub payload: &'a str,
}

impl<'a> Envelope<'a> {
    /// Split at the first '@', then at the first whitespace after it.
    /// Only that single separator is consumed, the payload is kept as sent.
    pub fn parse(raw: &'a str) -> Result<Self, PipelineError> {
        let (api_key, rest) = raw
            .split_once('@')
            .ok_or(PipelineError::MalformedEnvelope)?;

        let (log_type, payload) = match rest.char_indices().find(|(_, c)| c.is_whitespace()) {
            Some((idx, sep)) => (&rest[..idx], &rest[idx + sep.len_utf8()..]),
            None => (rest, ""),
        };

        Ok(Self {
            api_key: api_key.trim(),
            log_type,
            payload,
        })
    }
}
