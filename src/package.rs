use std::fmt::{Display, Formatter};

use thiserror::Error;
use url::Url;

/// Archive suffixes devpi serves as release files. Anything else in a
/// listing is a hard error, not a skipped entry.
pub const PACKAGE_EXTENSIONS: [&str; 5] = [".tar.gz", ".tar.bz2", ".zip", ".whl", ".egg"];

const BDIST_EXTENSIONS: [&str; 2] = [".whl", ".egg"];

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("unknown package type, cannot extract name and version from `{0}`")]
    UnrecognizedFormat(String),
    #[error("release URL `{0}` does not have the expected `<user>/<index>/+f/...` layout")]
    UnexpectedUrlLayout(String),
}

/// One release artifact, identified by the index owning it plus the
/// name and version embedded in its filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Package {
    pub index: String,
    pub name: String,
    pub version: String,
}

impl Package {
    /// Parse a release download URL such as
    /// `http://localhost:2414/user/index1/+f/45b/301745c6d8bbf/delete_me-0.1.tar.gz`.
    ///
    /// The owning index is recovered from the two path segments before the
    /// `+f` marker, name and version from the trailing filename.
    pub fn from_url(package_url: &str) -> Result<Self, ParseError> {
        let layout_error = || ParseError::UnexpectedUrlLayout(package_url.to_string());

        let url = Url::parse(package_url).map_err(|_| layout_error())?;
        let segments: Vec<&str> = url.path_segments().ok_or_else(layout_error)?.collect();
        let marker = segments
            .iter()
            .position(|segment| *segment == "+f")
            .ok_or_else(layout_error)?;
        if marker < 2 || segments.len() != marker + 4 {
            return Err(layout_error());
        }

        let index = format!("{}/{}", segments[marker - 2], segments[marker - 1]);
        let (name, version) = extract_name_and_version(segments[marker + 3])?;
        Ok(Package {
            index,
            name,
            version,
        })
    }

    /// Whether this is a development release per PEP 440, i.e. the version
    /// string contains a `.dev` segment.
    pub fn is_dev_release(&self) -> bool {
        self.version.contains(".dev")
    }
}

impl Display for Package {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} on {}", self.name, self.version, self.index)
    }
}

/// Split a release filename into package name and version.
///
/// Wheels and eggs put name and version in the first two dash-delimited
/// fields of the stem. Source archives are `<name>-<version><extension>`
/// where the name itself may contain dashes, so we first try the last dash
/// as the boundary and fall back to a full dash split (joining everything
/// but the last two fields as the name) when the right-hand side does not
/// start with a digit. This is deliberately a two-path heuristic, not a
/// single regular expression.
fn extract_name_and_version(filename: &str) -> Result<(String, String), ParseError> {
    for extension in BDIST_EXTENSIONS {
        if let Some(stem) = filename.strip_suffix(extension) {
            let mut fields = stem.split('-');
            return match (fields.next(), fields.next()) {
                (Some(name), Some(version)) => Ok((name.to_string(), version.to_string())),
                _ => Err(ParseError::UnrecognizedFormat(filename.to_string())),
            };
        }
    }

    let (name, version_and_extension) = match filename.rsplit_once('-') {
        Some((name, rest)) if rest.chars().next().is_some_and(|c| c.is_ascii_digit()) => {
            (name.to_string(), rest.to_string())
        }
        _ => {
            let parts: Vec<&str> = filename.split('-').collect();
            let boundary = parts.len().saturating_sub(2);
            (parts[..boundary].join("-"), parts[boundary..].join("-"))
        }
    };

    for extension in PACKAGE_EXTENSIONS {
        if let Some(version) = version_and_extension.strip_suffix(extension) {
            return Ok((name, version.to_string()));
        }
    }

    Err(ParseError::UnrecognizedFormat(filename.to_string()))
}
