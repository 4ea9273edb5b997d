//! Full request and response frames.

use crate::components::parse;
use crate::header::{RequestHeader, ResponseHeader, HEADER_SIZE};
use crate::{AuthComponent, CodecError, Operation, RequestBody, ResponseCode};

/// A decoded request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Fixed-size header
    pub header: RequestHeader,
    /// Credentials, if the header announced any
    pub auth: Option<AuthComponent>,
    /// Category-specific body
    pub body: RequestBody,
}

impl Request {
    /// Build a request, sizing the header from the components.
    pub fn new(
        operation: Operation,
        auth: Option<AuthComponent>,
        body: RequestBody,
    ) -> Result<Self, CodecError> {
        let mut header = RequestHeader::new(operation);
        header.auth_size = auth_bytes(&auth)?.len() as u32;
        header.body_size = body.to_bytes()?.len() as u32;
        Ok(Self { header, auth, body })
    }

    /// Encode the full frame. Header sizes are recomputed from the components.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let auth = auth_bytes(&self.auth)?;
        let body = self.body.to_bytes()?;
        let mut header = self.header.clone();
        header.auth_size = auth.len() as u32;
        header.body_size = body.len() as u32;

        let mut out = Vec::with_capacity(HEADER_SIZE + auth.len() + body.len());
        out.extend_from_slice(&header.encode()?);
        out.extend_from_slice(&auth);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a complete frame held in memory.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let header_bytes: &[u8; HEADER_SIZE] = bytes
            .get(..HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| {
                CodecError::MalformedHeader(format!(
                    "frame shorter than header: {} bytes",
                    bytes.len()
                ))
            })?;
        let header = RequestHeader::decode(header_bytes)?;

        let rest = &bytes[HEADER_SIZE..];
        let expected = header.payload_len();
        if rest.len() < expected {
            return Err(CodecError::TruncatedBody {
                expected,
                actual: rest.len(),
            });
        }
        let (auth, body) = rest[..expected].split_at(header.auth_size as usize);
        Self::from_parts(header, auth, body)
    }

    /// Assemble a request from a decoded header and its raw components.
    pub fn from_parts(
        header: RequestHeader,
        auth: &[u8],
        body: &[u8],
    ) -> Result<Self, CodecError> {
        let auth = if auth.is_empty() {
            None
        } else {
            let component: AuthComponent = parse("auth", auth)?;
            component.validate()?;
            Some(component)
        };
        let body = RequestBody::decode(header.category, body)?;
        Ok(Self { header, auth, body })
    }

    /// The verb named by the header, if any.
    pub fn operation(&self) -> Option<Operation> {
        self.header.operation()
    }
}

fn auth_bytes(auth: &Option<AuthComponent>) -> Result<Vec<u8>, CodecError> {
    match auth {
        Some(a) => Ok(serde_json::to_vec(a)?),
        None => Ok(Vec::new()),
    }
}

/// A response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Fixed-size header
    pub header: ResponseHeader,
    /// Optional JSON body
    pub body: Option<serde_json::Value>,
}

impl Response {
    /// A response with no body.
    pub fn new(code: ResponseCode, description: impl Into<String>) -> Self {
        Self {
            header: ResponseHeader::new(code, description),
            body: None,
        }
    }

    /// Attach a JSON body.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Echo a session iteration.
    pub fn with_iteration(mut self, iteration: u64) -> Self {
        self.header.iteration = Some(iteration);
        self
    }

    /// Mark that the server closes the connection after this response.
    pub fn ending_connection(mut self) -> Self {
        self.header.ended_connection = true;
        self
    }

    /// Parsed response code.
    pub fn code(&self) -> Option<ResponseCode> {
        self.header.response_code()
    }

    /// Encode the full frame.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let body = match &self.body {
            Some(v) => serde_json::to_vec(v)?,
            None => Vec::new(),
        };
        let mut header = self.header.clone();
        header.body_size = body.len() as u32;

        let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
        out.extend_from_slice(&header.encode()?);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode a complete frame held in memory.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let header_bytes: &[u8; HEADER_SIZE] = bytes
            .get(..HEADER_SIZE)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| CodecError::MalformedHeader("frame shorter than header".into()))?;
        let header = ResponseHeader::decode(header_bytes)?;
        let rest = &bytes[HEADER_SIZE..];
        let expected = header.body_size as usize;
        if rest.len() < expected {
            return Err(CodecError::TruncatedBody {
                expected,
                actual: rest.len(),
            });
        }
        Self::from_parts(header, &rest[..expected])
    }

    /// Assemble a response from a decoded header and its raw body.
    pub fn from_parts(header: ResponseHeader, body: &[u8]) -> Result<Self, CodecError> {
        let body = if body.is_empty() {
            None
        } else {
            Some(parse("response", body)?)
        };
        Ok(Self { header, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        FileComponent, InfoComponent, PermissionComponent, QueryTarget, Role, MAX_FILENAME_LEN,
        MAX_IDENTITY_LEN, MAX_PASSWORD_LEN, TOKEN_HEX_LEN,
    };

    fn max_identity() -> String {
        "u".repeat(MAX_IDENTITY_LEN)
    }

    fn max_filename() -> String {
        "f".repeat(MAX_FILENAME_LEN)
    }

    fn max_auth() -> AuthComponent {
        AuthComponent {
            identity: max_identity(),
            password: Some("p".repeat(MAX_PASSWORD_LEN)),
            new_password: None,
            token: Some("a".repeat(TOKEN_HEX_LEN)),
            refresh_digest: Some("b".repeat(128)),
        }
    }

    fn body_for(op: Operation) -> RequestBody {
        match op.category() {
            crate::Category::Auth => RequestBody::Empty,
            crate::Category::Info => {
                let mut c = InfoComponent::query(QueryTarget::File);
                c.subject_file = Some(max_filename());
                c.subject_file_owner = Some(max_identity());
                c.verbose = true;
                RequestBody::Info(c)
            }
            crate::Category::File => {
                let mut c = FileComponent::named(max_filename())
                    .owned_by(max_identity())
                    .with_data(&[0xAB; 512]);
                c.cursor_position = Some(u64::MAX);
                c.chunk_size = Some(u32::MAX);
                c.keepalive = true;
                RequestBody::File(c)
            }
            crate::Category::Permission => {
                let mut c = PermissionComponent::named(max_filename());
                c.subject_file_owner = Some(max_identity());
                c.subject_user = Some(max_identity());
                c.role = Some(Role::Manager);
                c.effect_duration = crate::MAX_EFFECT_DURATION;
                RequestBody::Permission(c)
            }
        }
    }

    #[test]
    fn every_operation_roundtrips_with_maximum_fields() {
        for op in Operation::ALL {
            let request = Request::new(op, Some(max_auth()), body_for(op)).unwrap();
            let bytes = request.encode().unwrap();
            let decoded = Request::decode(&bytes).unwrap();
            assert_eq!(decoded, request, "{op}");
            assert_eq!(decoded.operation(), Some(op));
        }
    }

    #[test]
    fn short_frame_is_truncated() {
        let request = Request::new(
            Operation::Create,
            Some(AuthComponent::with_token("alice", "a".repeat(TOKEN_HEX_LEN))),
            RequestBody::File(FileComponent::named("x.txt")),
        )
        .unwrap();
        let bytes = request.encode().unwrap();
        let err = Request::decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, CodecError::TruncatedBody { .. }));
    }

    #[test]
    fn smuggled_body_field_is_schema_violation() {
        let mut header = RequestHeader::new(Operation::Create);
        let body = br#"{"subject_file":"a.txt","exec":"rm -rf"}"#;
        header.body_size = body.len() as u32;
        let mut bytes = header.encode().unwrap().to_vec();
        bytes.extend_from_slice(body);
        assert!(matches!(
            Request::decode(&bytes),
            Err(CodecError::SchemaViolation { .. })
        ));
    }

    #[test]
    fn response_roundtrip() {
        let response = Response::new(ResponseCode::FileRead, "read complete")
            .with_body(serde_json::json!({"data": "00ff", "cursor_position": 2}))
            .with_iteration(3);
        let bytes = response.encode().unwrap();
        let decoded = Response::decode(&bytes).unwrap();
        assert_eq!(decoded.code(), Some(ResponseCode::FileRead));
        assert_eq!(decoded.body, response.body);
        assert_eq!(decoded.header.iteration, Some(3));
        assert_eq!(decoded.header.body_size as usize, bytes.len() - HEADER_SIZE);
    }

    #[test]
    fn header_is_fixed_size_regardless_of_body() {
        let small = Response::new(ResponseCode::Heartbeat, "").encode().unwrap();
        let large = Response::new(ResponseCode::FileRead, "")
            .with_body(serde_json::json!({"data": "ab".repeat(10_000)}))
            .encode()
            .unwrap();
        assert_eq!(small.len(), HEADER_SIZE);
        assert!(large.len() > HEADER_SIZE);
        assert!(ResponseHeader::decode((&large[..HEADER_SIZE]).try_into().unwrap()).is_ok());
    }
}
