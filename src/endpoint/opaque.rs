//! Endpoints of types no factory is registered for.
//!
//! The encapsulated body is kept verbatim so the endpoint can be
//! re-marshaled unchanged and, once a factory for its type is known,
//! decoded into the real endpoint.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::endpoint::parse_options;
use crate::error::{Result, TransportError};
use crate::stream::{EncodingVersion, InputStream, OutputStream};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpaqueEndpoint {
    type_id: i16,
    raw_encoding: EncodingVersion,
    raw_bytes: Vec<u8>,
}

impl OpaqueEndpoint {
    pub fn new(type_id: i16, raw_encoding: EncodingVersion, raw_bytes: Vec<u8>) -> Self {
        Self {
            type_id,
            raw_encoding,
            raw_bytes,
        }
    }

    /// Parses `-t type -e encoding -v base64`. `-t` and `-v` are required.
    pub(crate) fn parse(args: &mut Vec<String>) -> Result<Self> {
        let mut type_id: Option<i16> = None;
        let mut raw_encoding = EncodingVersion::V1_0;
        let mut raw_bytes: Option<Vec<u8>> = None;

        parse_options("opaque", args, |option, argument, endpoint| {
            match option {
                "-t" => {
                    if type_id.is_some() {
                        return Err(TransportError::parse(format!(
                            "multiple -t options in endpoint {endpoint}"
                        )));
                    }
                    if argument.is_empty() {
                        return Err(TransportError::parse(format!(
                            "no argument provided for -t option in endpoint {endpoint}"
                        )));
                    }
                    let value: i64 = argument.parse().map_err(|_| {
                        TransportError::parse(format!(
                            "invalid type value `{argument}' in endpoint {endpoint}"
                        ))
                    })?;
                    type_id = Some(i16::try_from(value).ok().filter(|t| *t >= 0).ok_or_else(
                        || {
                            TransportError::parse(format!(
                                "type value `{argument}' out of range in endpoint {endpoint}"
                            ))
                        },
                    )?);
                }
                "-v" => {
                    if raw_bytes.is_some() {
                        return Err(TransportError::parse(format!(
                            "multiple -v options in endpoint {endpoint}"
                        )));
                    }
                    if argument.is_empty() {
                        return Err(TransportError::parse(format!(
                            "no argument provided for -v option in endpoint {endpoint}"
                        )));
                    }
                    raw_bytes = Some(STANDARD.decode(argument).map_err(|e| {
                        TransportError::parse(format!(
                            "invalid base64 value `{argument}' in endpoint {endpoint}: {e}"
                        ))
                    })?);
                }
                "-e" => {
                    if argument.is_empty() {
                        return Err(TransportError::parse(format!(
                            "no argument provided for -e option in endpoint {endpoint}"
                        )));
                    }
                    raw_encoding = EncodingVersion::parse(argument).ok_or_else(|| {
                        TransportError::parse(format!(
                            "invalid encoding version `{argument}' in endpoint {endpoint}"
                        ))
                    })?;
                }
                _ => return Ok(false),
            }
            Ok(true)
        })?;

        let Some(type_id) = type_id else {
            return Err(TransportError::parse(format!(
                "no -t option in endpoint `opaque {}'",
                args.join(" ")
            )));
        };
        let Some(raw_bytes) = raw_bytes else {
            return Err(TransportError::parse(format!(
                "no -v option in endpoint `opaque -t {type_id} -e {raw_encoding}'"
            )));
        };

        Ok(Self {
            type_id,
            raw_encoding,
            raw_bytes,
        })
    }

    /// Reads the rest of the open encapsulation as the raw body.
    pub(crate) fn read(type_id: i16, stream: &mut InputStream) -> Result<Self> {
        let (raw_bytes, raw_encoding) = stream.read_encapsulation_body()?;
        Ok(Self {
            type_id,
            raw_encoding,
            raw_bytes,
        })
    }

    /// Writes type, encapsulation header and raw body.
    pub(crate) fn write(&self, stream: &mut OutputStream) {
        stream.write_i16(self.type_id);
        stream.start_encapsulation(self.raw_encoding);
        stream.write_blob(&self.raw_bytes);
        stream.end_encapsulation();
    }

    pub(crate) fn options(&self, out: &mut String) {
        out.push_str(&format!(
            " -t {} -e {} -v {}",
            self.type_id,
            self.raw_encoding,
            STANDARD.encode(&self.raw_bytes)
        ));
    }

    pub fn type_id(&self) -> i16 {
        self.type_id
    }

    pub fn raw_encoding(&self) -> EncodingVersion {
        self.raw_encoding
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw_bytes
    }
}
