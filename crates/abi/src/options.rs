//! Per-call configuration recognised by the codecs.

use std::str::FromStr;

/// How strings are encoded in linear memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StringEncoding {
    /// UTF-8; one code unit per byte.
    Utf8,
    /// UTF-16; one code unit per two bytes, little-endian.
    Utf16,
    /// Latin-1 with a UTF-16 escape hatch. Accepted by configuration but
    /// traps on use.
    Latin1Utf16,
}

impl Default for StringEncoding {
    fn default() -> StringEncoding {
        StringEncoding::Utf8
    }
}

impl FromStr for StringEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<StringEncoding, String> {
        match s {
            "utf-8" => Ok(StringEncoding::Utf8),
            "utf-16" => Ok(StringEncoding::Utf16),
            "latin1+utf-16" => Ok(StringEncoding::Latin1Utf16),
            other => Err(format!("unknown string encoding `{other}`")),
        }
    }
}

/// Options that shape how values are marshalled.
#[derive(Clone, Debug)]
pub struct CanonicalOptions {
    encoding: StringEncoding,
    keep_option: bool,
}

impl CanonicalOptions {
    /// Options with the defaults: UTF-8 strings, lenient option lowering.
    pub fn new() -> CanonicalOptions {
        CanonicalOptions {
            encoding: StringEncoding::default(),
            keep_option: false,
        }
    }

    /// Selects the string encoding.
    pub fn encoding(mut self, encoding: StringEncoding) -> CanonicalOptions {
        self.encoding = encoding;
        self
    }

    /// When set, `option<T>` payloads must always be handed to the codec in
    /// their wrapped form; when unset (the default) a bare payload value is
    /// accepted on lowering and wrapped as `some`.
    pub fn keep_option(mut self, keep: bool) -> CanonicalOptions {
        self.keep_option = keep;
        self
    }

    /// The configured string encoding.
    pub fn string_encoding(&self) -> StringEncoding {
        self.encoding
    }

    /// Whether option values must stay wrapped on lowering.
    pub fn keeps_option(&self) -> bool {
        self.keep_option
    }
}

impl Default for CanonicalOptions {
    fn default() -> CanonicalOptions {
        CanonicalOptions::new()
    }
}
