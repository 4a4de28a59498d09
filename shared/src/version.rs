use std::{
    fmt::{self, Display},
    str::FromStr,
};

use http::Version;

#[derive(Debug, Clone, Default, Copy, PartialEq, Eq, Hash)]
pub struct HttpVersion(pub http::Version);

impl Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self.0 {
            Version::HTTP_09 => "HTTP/0.9",
            Version::HTTP_10 => "HTTP/1.0",
            Version::HTTP_11 => "HTTP/1.1",
            _ => "HTTP/1.1",
        };
        f.write_str(s)
    }
}

impl FromStr for HttpVersion {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v = match s.to_ascii_uppercase().as_str() {
            "HTTP/0.9" => Version::HTTP_09,
            "HTTP/1.0" => Version::HTTP_10,
            "HTTP/1.1" => Version::HTTP_11,
            _ => Version::HTTP_11,
        };
        Ok(HttpVersion(v))
    }
}

impl From<Version> for HttpVersion {
    fn from(v: Version) -> Self {
        HttpVersion(v)
    }
}

impl From<HttpVersion> for Version {
    fn from(h: HttpVersion) -> Self {
        h.0
    }
}
