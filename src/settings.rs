use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use bytes::{Buf, BufMut};

use crate::varint::{VarInt, VarIntUnexpectedEnd};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Setting(pub VarInt);

impl Setting {
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        Ok(Setting(VarInt::decode(buf)?))
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf)
    }
}

macro_rules! settings {
    {$($name:ident = $val:expr,)*} => {
        impl Setting {
            $(pub const $name: Setting = Setting(VarInt::from_u32($val));)*
        }
    }
}

settings! {
    HEADER_TABLE_SIZE = 0x1,
    MAX_HEADER_LIST_SIZE = 0x6,
}

/// A map of settings to values, carried in the SETTINGS frame on each
/// control stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings(HashMap<Setting, VarInt>);

impl Default for Settings {
    fn default() -> Self {
        let mut settings = Settings(HashMap::new());
        settings.insert(Setting::HEADER_TABLE_SIZE, VarInt::from_u32(4096));
        settings.insert(Setting::MAX_HEADER_LIST_SIZE, VarInt::MAX);
        settings
    }
}

impl Settings {
    /// Decode a SETTINGS frame payload: (id, value) varint pairs running to
    /// the end of the payload.
    pub fn decode_payload<B: Buf>(buf: &mut B) -> Result<Self, VarIntUnexpectedEnd> {
        let mut settings = Settings(HashMap::new());
        while buf.has_remaining() {
            let id = Setting::decode(buf)?;
            let value = VarInt::decode(buf)?;
            settings.0.insert(id, value);
        }
        Ok(settings)
    }

    pub fn encode_payload<B: BufMut>(&self, buf: &mut B) {
        // Deterministic order keeps the encoding stable across runs.
        let mut entries: Vec<_> = self.0.iter().collect();
        entries.sort_by_key(|(id, _)| id.0);

        for (id, value) in entries {
            id.encode(buf);
            value.encode(buf);
        }
    }

    pub fn header_table_size(&self) -> u64 {
        self.get(&Setting::HEADER_TABLE_SIZE)
            .map(|v| v.into_inner())
            .unwrap_or(0)
    }

    pub fn max_header_list_size(&self) -> u64 {
        self.get(&Setting::MAX_HEADER_LIST_SIZE)
            .map(|v| v.into_inner())
            .unwrap_or(u64::MAX)
    }

    /// Fold the peer's settings into ours, last writer wins.
    pub fn merge(&mut self, other: &Settings) {
        for (id, value) in other.iter() {
            self.0.insert(*id, *value);
        }
    }
}

impl Deref for Settings {
    type Target = HashMap<Setting, VarInt>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Settings {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
