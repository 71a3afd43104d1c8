pub mod content;
pub mod cost;
pub mod execution;
pub mod item_hash;
pub mod merge;
pub mod message;
pub mod range;
pub mod sync;

pub use content::{AggregateContent, ForgetContent, PostContent, StoreContent};
pub use execution::{InstanceContent, MachineVolume, Payment, PaymentType, ProgramContent};
pub use item_hash::{item_type_from_hash, sha256_hex, UnknownHash};
pub use message::{parse_raw_message, MessageContent, RawMessage};
pub use range::{DatetimeRange, MultiRange};

/// Declares a closed string enum: `Display`/`FromStr` over the declared
/// tokens, serde as plain strings, and sqlx encoding as Postgres `TEXT`.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal,)+ }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(crate::ParseEnumError {
                        type_name: stringify!($name),
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let s = String::deserialize(d)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }

        impl sqlx::Type<sqlx::Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <&str as sqlx::Type<sqlx::Postgres>>::type_info()
            }
            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl sqlx::postgres::PgHasArrayType for $name {
            fn array_type_info() -> sqlx::postgres::PgTypeInfo {
                <&str as sqlx::postgres::PgHasArrayType>::array_type_info()
            }
        }

        impl sqlx::Encode<'_, sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> sqlx::encode::IsNull {
                <&str as sqlx::Encode<'_, sqlx::Postgres>>::encode(self.as_str(), buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $name {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let s = <&str as sqlx::Decode<'r, sqlx::Postgres>>::decode(value)?;
                Ok(s.parse::<$name>()?)
            }
        }
    };
}
pub(crate) use text_enum;

#[derive(Debug, thiserror::Error)]
#[error("'{value}' is not a valid {type_name}")]
pub struct ParseEnumError {
    pub type_name: &'static str,
    pub value: String,
}

text_enum! {
    /// Chains whose accounts can sign and publish messages.
    Chain {
        Avalanche => "AVAX",
        Bsc => "BSC",
        Cosmos => "CSDK",
        Ethereum => "ETH",
        Nuls => "NULS",
        Nuls2 => "NULS2",
        Solana => "SOL",
        Substrate => "DOT",
        Tezos => "TEZOS",
    }
}

text_enum! {
    MessageType {
        Aggregate => "AGGREGATE",
        Forget => "FORGET",
        Instance => "INSTANCE",
        Post => "POST",
        Program => "PROGRAM",
        Store => "STORE",
    }
}

text_enum! {
    /// Where the content of a message lives: in the message itself, in a
    /// sha256-addressed blob, or in an IPFS object.
    ItemType {
        Inline => "inline",
        Storage => "storage",
        Ipfs => "ipfs",
    }
}

text_enum! {
    MessageStatus {
        Pending => "pending",
        Processed => "processed",
        Rejected => "rejected",
        Forgotten => "forgotten",
    }
}

text_enum! {
    FileType {
        File => "file",
        Directory => "directory",
    }
}

text_enum! {
    /// Discriminator of the file_pins relation.
    FilePinType {
        Content => "content",
        Message => "message",
        Tx => "tx",
        GracePeriod => "grace_period",
    }
}

/// Machine-readable rejection reasons, stable across releases. The integer
/// values are persisted in `rejected_messages.error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InternalError,
    InvalidFormat,
    InvalidSignature,
    PermissionDenied,
    ContentUnavailable,
    FileUnavailable,
    BalanceInsufficient,
    PostAmendNoTarget,
    PostAmendTargetNotFound,
    PostAmendAmend,
    StoreRefNotFound,
    StoreCannotUpdateStoreWithRef,
    VmRefNotFound,
    VmVolumeNotFound,
    VmUpdateNotAllowed,
    VmUpdateWrongVersion,
    VmVolumeParentTooLarge,
    ForgetNoTarget,
    ForgetTargetNotFound,
    ForgetForget,
    ForgetNotAllowed,
}

impl ErrorCode {
    pub fn code(&self) -> i32 {
        use ErrorCode::*;
        match self {
            InternalError => -1,
            InvalidFormat => 0,
            InvalidSignature => 1,
            PermissionDenied => 2,
            ContentUnavailable => 3,
            FileUnavailable => 4,
            BalanceInsufficient => 5,
            PostAmendNoTarget => 100,
            PostAmendTargetNotFound => 101,
            PostAmendAmend => 102,
            StoreRefNotFound => 200,
            StoreCannotUpdateStoreWithRef => 201,
            VmRefNotFound => 300,
            VmVolumeNotFound => 301,
            VmUpdateNotAllowed => 302,
            VmUpdateWrongVersion => 303,
            VmVolumeParentTooLarge => 304,
            ForgetNoTarget => 500,
            ForgetTargetNotFound => 501,
            ForgetForget => 502,
            ForgetNotAllowed => 503,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        use ErrorCode::*;
        Some(match code {
            -1 => InternalError,
            0 => InvalidFormat,
            1 => InvalidSignature,
            2 => PermissionDenied,
            3 => ContentUnavailable,
            4 => FileUnavailable,
            5 => BalanceInsufficient,
            100 => PostAmendNoTarget,
            101 => PostAmendTargetNotFound,
            102 => PostAmendAmend,
            200 => StoreRefNotFound,
            201 => StoreCannotUpdateStoreWithRef,
            300 => VmRefNotFound,
            301 => VmVolumeNotFound,
            302 => VmUpdateNotAllowed,
            303 => VmUpdateWrongVersion,
            304 => VmVolumeParentTooLarge,
            500 => ForgetNoTarget,
            501 => ForgetTargetNotFound,
            502 => ForgetForget,
            503 => ForgetNotAllowed,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn chain_round_trips_through_text() {
        for chain in [
            Chain::Avalanche,
            Chain::Bsc,
            Chain::Cosmos,
            Chain::Ethereum,
            Chain::Nuls,
            Chain::Nuls2,
            Chain::Solana,
            Chain::Substrate,
            Chain::Tezos,
        ] {
            assert_eq!(chain.as_str().parse::<Chain>().unwrap(), chain);
        }
        assert!("DOGE".parse::<Chain>().is_err());
    }

    #[test]
    fn message_type_serde_uses_wire_names() {
        assert_eq!(
            serde_json::to_string(&MessageType::Aggregate).unwrap(),
            "\"AGGREGATE\""
        );
        let parsed: MessageType = serde_json::from_str("\"STORE\"").unwrap();
        assert_eq!(parsed, MessageType::Store);
    }

    #[test]
    fn error_codes_round_trip() {
        for code in [-1, 0, 1, 2, 3, 4, 5, 100, 101, 102, 200, 201, 300, 301, 302, 303, 304, 500,
            501, 502, 503]
        {
            assert_eq!(ErrorCode::from_code(code).unwrap().code(), code);
        }
        assert!(ErrorCode::from_code(999).is_none());
    }
}
