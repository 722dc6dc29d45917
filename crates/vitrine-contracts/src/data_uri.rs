use std::fmt;

pub const DEFAULT_MEDIA_TYPE: &str = "image/png";

/// `data:{media_type};base64,{payload}` split into its two halves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    pub media_type: String,
    pub payload: String,
}

impl DataUri {
    pub fn new(media_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            payload: payload.into(),
        }
    }

    /// Splits on the first comma. The media type is whatever sits between
    /// `data:` and the first `;` of the header; an absent or empty media type
    /// falls back to `image/png`. Returns `None` when there is no payload.
    pub fn parse(raw: &str) -> Option<Self> {
        let (header, payload) = raw.trim().split_once(',')?;
        if payload.is_empty() {
            return None;
        }
        let media_type = header
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(';').map(|(media, _)| media.trim()))
            .filter(|media| !media.is_empty())
            .unwrap_or(DEFAULT_MEDIA_TYPE);
        Some(Self::new(media_type, payload))
    }
}

impl fmt::Display for DataUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "data:{};base64,{}", self.media_type, self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::DataUri;

    #[test]
    fn parse_reads_media_type_and_payload() {
        let uri = DataUri::parse("data:image/jpeg;base64,QUJD").unwrap();
        assert_eq!(uri.media_type, "image/jpeg");
        assert_eq!(uri.payload, "QUJD");
        assert_eq!(uri.to_string(), "data:image/jpeg;base64,QUJD");
    }

    #[test]
    fn parse_defaults_missing_media_type_to_png() {
        assert_eq!(
            DataUri::parse("data:;base64,QUJD").unwrap().media_type,
            "image/png"
        );
        assert_eq!(DataUri::parse("data:,QUJD").unwrap().media_type, "image/png");
        assert_eq!(DataUri::parse("garbage,QUJD").unwrap().payload, "QUJD");
    }

    #[test]
    fn parse_rejects_missing_payload() {
        assert!(DataUri::parse("data:image/png;base64").is_none());
        assert!(DataUri::parse("data:image/png;base64,").is_none());
        assert!(DataUri::parse("").is_none());
    }
}
