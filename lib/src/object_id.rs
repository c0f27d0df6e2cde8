// Copyright 2025 The Strata Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![allow(missing_docs)]

pub trait ObjectId {
    fn object_type(&self) -> String;
    fn as_bytes(&self) -> &[u8];
    fn to_bytes(&self) -> Vec<u8>;
    fn hex(&self) -> String;

    /// Hex representation truncated to at most `len` characters.
    fn short_hex(&self, len: usize) -> String {
        let mut hex = self.hex();
        hex.truncate(len);
        hex
    }
}

pub(crate) fn encode_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        hex.push(char::from_digit(u32::from(b >> 4), 16).unwrap());
        hex.push(char::from_digit(u32::from(b & 0xf), 16).unwrap());
    }
    hex
}

pub(crate) fn decode_hex(hex: impl AsRef<[u8]>) -> Option<Vec<u8>> {
    let hex = hex.as_ref();
    if hex.len() % 2 != 0 {
        return None;
    }
    hex.chunks_exact(2)
        .map(|chunk| {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

// Defines a new struct type with visibility `vis` and name `ident` containing
// a single Vec<u8> used to store an identifier (typically the output of a hash
// function) as bytes. Types defined using this macro automatically implement
// the `ObjectId` trait. Documentation comments written inside the macro
// invocation are captured and associated with the defined type.
macro_rules! id_type {
    (   $(#[$attr:meta])*
        $vis:vis $name:ident
    ) => {
        $(#[$attr])*
        #[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
        $vis struct $name(Vec<u8>);

        #[allow(dead_code)]
        impl $name {
            pub fn new(value: Vec<u8>) -> Self {
                Self(value)
            }

            pub fn from_bytes(bytes: &[u8]) -> Self {
                Self(bytes.to_vec())
            }

            /// Parses the given hex string into an id.
            ///
            /// The given string must be valid. A static str is required to
            /// prevent API misuse.
            pub fn from_hex(hex: &'static str) -> Self {
                Self::try_from_hex(hex).unwrap()
            }

            /// Parses the given hex string into an id.
            pub fn try_from_hex(hex: impl AsRef<[u8]>) -> Option<Self> {
                $crate::object_id::decode_hex(hex).map(Self)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                f.debug_tuple(stringify!($name)).field(&self.hex()).finish()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
                f.pad(&$crate::object_id::ObjectId::hex(self))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                use $crate::object_id::ObjectId as _;
                if serializer.is_human_readable() {
                    self.hex().serialize(serializer)
                } else {
                    self.as_bytes().serialize(serializer)
                }
            }
        }

        impl $crate::object_id::ObjectId for $name {
            fn object_type(&self) -> String {
                stringify!($name)
                    .strip_suffix("Id")
                    .unwrap()
                    .to_ascii_lowercase()
                    .to_string()
            }

            fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            fn to_bytes(&self) -> Vec<u8> {
                self.0.clone()
            }

            fn hex(&self) -> String {
                $crate::object_id::encode_hex(&self.0)
            }
        }
    };
}

id_type!(
    /// Identifier for a commit based on its content hash.
    pub CommitId
);
id_type!(
    /// Identifier for a file blob based on its content hash.
    pub BlobId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let id = CommitId::from_hex("cce947b98a050c6d356bc6ba95030254914027b1");
        assert_eq!(id.hex(), "cce947b98a050c6d356bc6ba95030254914027b1");
        assert_eq!(id.as_bytes().len(), 20);
    }

    #[test]
    fn test_short_hex() {
        let id = CommitId::from_hex("cce947b98a050c6d356bc6ba95030254914027b1");
        assert_eq!(id.short_hex(7), "cce947b");
        assert_eq!(id.short_hex(100), id.hex());
    }

    #[test]
    fn test_decode_hex_invalid() {
        assert_eq!(CommitId::try_from_hex("abc"), None);
        assert_eq!(CommitId::try_from_hex("zz"), None);
        assert_eq!(
            CommitId::try_from_hex("ab"),
            Some(CommitId::from_bytes(&[0xab]))
        );
    }

    #[test]
    fn test_object_type() {
        let id = BlobId::from_hex("ff");
        assert_eq!(id.object_type(), "blob");
    }

    #[test]
    fn test_debug_format() {
        let id = CommitId::from_hex("ff00");
        assert_eq!(format!("{id:?}"), r#"CommitId("ff00")"#);
    }
}
