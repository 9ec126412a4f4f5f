//! Identification handshake and API introspection payloads.

use std::collections::BTreeMap;

use rmpv::Value;

use crate::DecodeError;

/// What kind of client this connection is, as announced to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Remote,
    MsgpackRpc,
    Ui,
    Embedder,
    Host,
    Plugin,
}

impl ClientType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::MsgpackRpc => "msgpack-rpc",
            Self::Ui => "ui",
            Self::Embedder => "embedder",
            Self::Host => "host",
            Self::Plugin => "plugin",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    pub commit: Option<String>,
}

impl ClientVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            ..Self::default()
        }
    }

    fn to_value(&self) -> Value {
        let mut entries = vec![
            (Value::from("major"), Value::from(self.major)),
            (Value::from("minor"), Value::from(self.minor)),
            (Value::from("patch"), Value::from(self.patch)),
        ];
        if let Some(prerelease) = &self.prerelease {
            entries.push((Value::from("prerelease"), Value::from(prerelease.as_str())));
        }
        if let Some(commit) = &self.commit {
            entries.push((Value::from("commit"), Value::from(commit.as_str())));
        }
        Value::Map(entries)
    }
}

/// One entry of the announced method table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodInfo {
    /// Invoked as a notification rather than a request.
    pub is_async: bool,
    pub nargs: Option<u32>,
}

impl MethodInfo {
    fn to_value(&self) -> Value {
        let mut entries = vec![(Value::from("async"), Value::from(self.is_async))];
        if let Some(nargs) = self.nargs {
            entries.push((Value::from("nargs"), Value::from(nargs)));
        }
        Value::Map(entries)
    }
}

/// Identity sent to the peer when the session starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub name: String,
    pub version: ClientVersion,
    pub client_type: ClientType,
    /// When empty, the session announces its registered request handlers.
    pub methods: BTreeMap<String, MethodInfo>,
    pub attributes: BTreeMap<String, String>,
}

impl ClientInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: ClientVersion::default(),
            client_type: ClientType::default(),
            methods: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_version(mut self, version: ClientVersion) -> Self {
        self.version = version;
        self
    }

    pub fn with_type(mut self, client_type: ClientType) -> Self {
        self.client_type = client_type;
        self
    }

    pub fn with_method(mut self, name: impl Into<String>, info: MethodInfo) -> Self {
        self.methods.insert(name.into(), info);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Positional arguments: `(name, version, type, methods, attributes)`.
    pub fn to_args(&self) -> Vec<Value> {
        let methods = self
            .methods
            .iter()
            .map(|(name, info)| (Value::from(name.as_str()), info.to_value()))
            .collect();
        let attributes = self
            .attributes
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str())))
            .collect();

        vec![
            Value::from(self.name.as_str()),
            self.version.to_value(),
            Value::from(self.client_type.as_str()),
            Value::Map(methods),
            Value::Map(attributes),
        ]
    }
}

/// Result of the API introspection call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiInfo {
    /// Handle the peer assigned to this connection.
    pub channel_id: u64,
    /// Everything after the channel id (the peer's API description).
    pub metadata: Value,
}

impl ApiInfo {
    /// Parse `[channel_id, metadata]`.
    pub fn from_value(value: Value) -> Result<Self, DecodeError> {
        let mut items = match value {
            Value::Array(items) if !items.is_empty() => items.into_iter(),
            other => {
                return Err(DecodeError::InvalidValue(format!(
                    "api info must be a non-empty array, got {other}"
                )));
            }
        };

        let channel_id = items
            .next()
            .and_then(|v| v.as_u64())
            .ok_or_else(|| DecodeError::InvalidValue("channel id is not an integer".into()))?;
        let metadata = items.next().unwrap_or(Value::Nil);

        Ok(Self {
            channel_id,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_info_args_are_positional() {
        let info = ClientInfo::new("mprpc-test")
            .with_version(ClientVersion::new(1, 2, 3))
            .with_type(ClientType::Plugin)
            .with_method("ping", MethodInfo::default())
            .with_attribute("website", "example.invalid");

        let args = info.to_args();
        assert_eq!(args.len(), 5);
        assert_eq!(args[0], Value::from("mprpc-test"));
        assert_eq!(
            args[1],
            Value::Map(vec![
                (Value::from("major"), Value::from(1u64)),
                (Value::from("minor"), Value::from(2u64)),
                (Value::from("patch"), Value::from(3u64)),
            ])
        );
        assert_eq!(args[2], Value::from("plugin"));
        assert_eq!(
            args[3],
            Value::Map(vec![(
                Value::from("ping"),
                Value::Map(vec![(Value::from("async"), Value::from(false))]),
            )])
        );
        assert_eq!(
            args[4],
            Value::Map(vec![(Value::from("website"), Value::from("example.invalid"))])
        );
    }

    #[test]
    fn api_info_takes_the_leading_channel_id() {
        let value = Value::Array(vec![
            Value::from(5),
            Value::Map(vec![(Value::from("version"), Value::Nil)]),
        ]);
        let info = ApiInfo::from_value(value).unwrap();
        assert_eq!(info.channel_id, 5);
        assert!(info.metadata.is_map());
    }

    #[test]
    fn api_info_rejects_non_integer_channel() {
        let value = Value::Array(vec![Value::from("five")]);
        assert!(ApiInfo::from_value(value).is_err());
        assert!(ApiInfo::from_value(Value::Nil).is_err());
    }
}
