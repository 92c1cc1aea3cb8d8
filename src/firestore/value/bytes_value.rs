use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
    Engine as _,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct BytesValue(Vec<u8>);

impl BytesValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Accepts padded and unpadded input.
    pub fn from_base64(value: &str) -> Result<Self, base64::DecodeError> {
        STANDARD
            .decode(value)
            .or_else(|_| STANDARD_NO_PAD.decode(value.trim_end_matches('=')))
            .map(Self)
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for BytesValue {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}
