use http::Request;

use crate::{RecordExtractor, RequestRecord};

/// Reads the queue attributes from HTTP headers.
///
/// The IP comes from the first `x-forwarded-for` hop, falling back to
/// `x-real-ip`. Only use this behind a proxy that sets those headers; the
/// client controls them otherwise. The user id comes from a header the
/// host's auth middleware sets after validating the session.
#[derive(Clone, Debug)]
pub struct HeaderRecordExtractor {
    user_id_header: Option<String>,
}

impl Default for HeaderRecordExtractor {
    fn default() -> Self {
        Self {
            user_id_header: Some("x-user-id".to_string()),
        }
    }
}

impl HeaderRecordExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header carrying the authenticated user id, or `None` to treat every
    /// request as anonymous.
    pub fn with_user_id_header(mut self, header: Option<&str>) -> Self {
        self.user_id_header = header.map(str::to_ascii_lowercase);
        self
    }

    fn header<'a, B>(req: &'a Request<B>, name: &str) -> Option<&'a str> {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

impl<B> RecordExtractor<Request<B>> for HeaderRecordExtractor {
    fn extract(&self, req: &Request<B>) -> RequestRecord {
        let ip = Self::header(req, "x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .or_else(|| Self::header(req, "x-real-ip"));
        let user_agent = Self::header(req, "user-agent");
        let user_id = self
            .user_id_header
            .as_deref()
            .and_then(|name| Self::header(req, name));

        RequestRecord::from_parts(ip, user_agent, user_id)
    }
}
