//! # Handshake Messages
//!
//! The messages exchanged between negotiation and the start of the signal
//! proxy session: client init, optional core setup, login and session init.
//!
//! ## Wire Format
//! A handshake frame is a `QVariantList` alternating keys and values:
//! ```text
//! [count i32] [key QByteArray] [value] [key QByteArray] [value] ...
//! ```
//! Keys are UTF-8. The `MsgType` key names the message.

use bytes::{Bytes, BytesMut};

use crate::core::features::FeatureSet;
use crate::core::models::{BufferInfo, NetworkId};
use crate::core::primitive::write_count;
use crate::core::serializer::SerializerRegistry;
use crate::core::variant::{FromQVariant, QVariant, QVariantList, QVariantMap};
use crate::error::{constants, ProtocolError, Result};

pub mod keys {
    pub const MSG_TYPE: &str = "MsgType";
    pub const CLIENT_VERSION: &str = "ClientVersion";
    pub const CLIENT_DATE: &str = "ClientDate";
    pub const FEATURES: &str = "Features";
    pub const FEATURE_LIST: &str = "FeatureList";
    pub const CORE_FEATURES: &str = "CoreFeatures";
    pub const STORAGE_BACKENDS: &str = "StorageBackends";
    pub const AUTHENTICATORS: &str = "Authenticators";
    pub const CONFIGURED: &str = "Configured";
    pub const ERROR: &str = "Error";
    pub const USER: &str = "User";
    pub const PASSWORD: &str = "Password";
    pub const SETUP_DATA: &str = "SetupData";
    pub const ADMIN_USER: &str = "AdminUser";
    pub const ADMIN_PASSWD: &str = "AdminPasswd";
    pub const BACKEND: &str = "Backend";
    pub const CONNECTION_PROPERTIES: &str = "ConnectionProperties";
    pub const AUTHENTICATOR: &str = "Authenticator";
    pub const AUTH_PROPERTIES: &str = "AuthProperties";
    pub const SESSION_STATE: &str = "SessionState";
    pub const BUFFER_INFOS: &str = "BufferInfos";
    pub const NETWORK_IDS: &str = "NetworkIds";
    pub const IDENTITIES: &str = "Identities";
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeMessage {
    ClientInit {
        client_version: String,
        build_date: String,
        features: FeatureSet,
    },
    ClientInitAck {
        core_features: FeatureSet,
        backend_info: QVariantList,
        authenticator_info: QVariantList,
        /// `None` when the core left the flag out
        core_configured: Option<bool>,
    },
    ClientInitReject {
        error: Option<String>,
    },
    ClientLogin {
        user: String,
        password: String,
    },
    ClientLoginAck,
    ClientLoginReject {
        error: Option<String>,
    },
    CoreSetupData {
        admin_user: String,
        admin_password: String,
        backend: String,
        setup_data: QVariantMap,
        authenticator: String,
        auth_setup_data: QVariantMap,
    },
    CoreSetupAck,
    CoreSetupReject {
        error: Option<String>,
    },
    SessionInit {
        identities: QVariantList,
        buffer_infos: Vec<BufferInfo>,
        network_ids: Vec<NetworkId>,
    },
}

fn field<T: FromQVariant>(map: &QVariantMap, key: &str) -> Option<T> {
    map.get(key).and_then(T::from_qvariant)
}

fn required<T: FromQVariant>(map: &QVariantMap, key: &str) -> Result<T> {
    field(map, key).ok_or_else(|| {
        ProtocolError::MalformedValue(format!("handshake field '{key}' missing or mistyped"))
    })
}

/// Absent is empty, present but mistyped is an error.
fn optional<T: FromQVariant + Default>(map: &QVariantMap, key: &str) -> Result<T> {
    match map.get(key) {
        None => Ok(T::default()),
        Some(value) => T::from_qvariant(value).ok_or_else(|| {
            ProtocolError::MalformedValue(format!("handshake field '{key}' mistyped"))
        }),
    }
}

fn features_of(map: &QVariantMap, legacy_key: &str) -> FeatureSet {
    let legacy: u32 = field(map, legacy_key).unwrap_or(0);
    let names: Vec<String> = field(map, keys::FEATURE_LIST).unwrap_or_default();
    FeatureSet::build(legacy, names)
}

impl HandshakeMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            HandshakeMessage::ClientInit { .. } => "ClientInit",
            HandshakeMessage::ClientInitAck { .. } => "ClientInitAck",
            HandshakeMessage::ClientInitReject { .. } => "ClientInitReject",
            HandshakeMessage::ClientLogin { .. } => "ClientLogin",
            HandshakeMessage::ClientLoginAck => "ClientLoginAck",
            HandshakeMessage::ClientLoginReject { .. } => "ClientLoginReject",
            HandshakeMessage::CoreSetupData { .. } => "CoreSetupData",
            HandshakeMessage::CoreSetupAck => "CoreSetupAck",
            HandshakeMessage::CoreSetupReject { .. } => "CoreSetupReject",
            HandshakeMessage::SessionInit { .. } => "SessionInit",
        }
    }

    /// Key/value pairs in wire order, `MsgType` first.
    pub fn to_fields(&self) -> Vec<(&'static str, QVariant)> {
        let mut fields = vec![(keys::MSG_TYPE, QVariant::from(self.msg_type()))];
        match self {
            HandshakeMessage::ClientInit {
                client_version,
                build_date,
                features,
            } => {
                fields.push((keys::CLIENT_VERSION, QVariant::from(client_version.as_str())));
                fields.push((keys::CLIENT_DATE, QVariant::from(build_date.as_str())));
                fields.push((keys::FEATURES, QVariant::UInt(features.legacy_features())));
                fields.push((
                    keys::FEATURE_LIST,
                    QVariant::string_list(features.feature_list()),
                ));
            }
            HandshakeMessage::ClientInitAck {
                core_features,
                backend_info,
                authenticator_info,
                core_configured,
            } => {
                fields.push((
                    keys::CORE_FEATURES,
                    QVariant::UInt(core_features.legacy_features()),
                ));
                fields.push((keys::STORAGE_BACKENDS, QVariant::from(backend_info.clone())));
                fields.push((
                    keys::AUTHENTICATORS,
                    QVariant::from(authenticator_info.clone()),
                ));
                if let Some(configured) = core_configured {
                    fields.push((keys::CONFIGURED, QVariant::Bool(*configured)));
                }
                fields.push((
                    keys::FEATURE_LIST,
                    QVariant::string_list(core_features.feature_list()),
                ));
            }
            HandshakeMessage::ClientInitReject { error }
            | HandshakeMessage::ClientLoginReject { error }
            | HandshakeMessage::CoreSetupReject { error } => {
                if let Some(error) = error {
                    fields.push((keys::ERROR, QVariant::from(error.as_str())));
                }
            }
            HandshakeMessage::ClientLogin { user, password } => {
                fields.push((keys::USER, QVariant::from(user.as_str())));
                fields.push((keys::PASSWORD, QVariant::from(password.as_str())));
            }
            HandshakeMessage::ClientLoginAck | HandshakeMessage::CoreSetupAck => {}
            HandshakeMessage::CoreSetupData {
                admin_user,
                admin_password,
                backend,
                setup_data,
                authenticator,
                auth_setup_data,
            } => {
                let mut data = QVariantMap::new();
                data.insert(keys::ADMIN_USER.into(), QVariant::from(admin_user.as_str()));
                data.insert(
                    keys::ADMIN_PASSWD.into(),
                    QVariant::from(admin_password.as_str()),
                );
                data.insert(keys::BACKEND.into(), QVariant::from(backend.as_str()));
                data.insert(
                    keys::CONNECTION_PROPERTIES.into(),
                    QVariant::from(setup_data.clone()),
                );
                data.insert(
                    keys::AUTHENTICATOR.into(),
                    QVariant::from(authenticator.as_str()),
                );
                data.insert(
                    keys::AUTH_PROPERTIES.into(),
                    QVariant::from(auth_setup_data.clone()),
                );
                fields.push((keys::SETUP_DATA, QVariant::from(data)));
            }
            HandshakeMessage::SessionInit {
                identities,
                buffer_infos,
                network_ids,
            } => {
                let mut state = QVariantMap::new();
                state.insert(keys::IDENTITIES.into(), QVariant::from(identities.clone()));
                state.insert(
                    keys::BUFFER_INFOS.into(),
                    QVariant::QVariantList(
                        buffer_infos.iter().cloned().map(QVariant::from).collect(),
                    ),
                );
                state.insert(
                    keys::NETWORK_IDS.into(),
                    QVariant::QVariantList(network_ids.iter().copied().map(QVariant::from).collect()),
                );
                fields.push((keys::SESSION_STATE, QVariant::from(state)));
            }
        }
        fields
    }

    pub fn from_map(map: &QVariantMap) -> Result<Self> {
        let msg_type: String = field(map, keys::MSG_TYPE).ok_or_else(|| {
            ProtocolError::MalformedValue(constants::ERR_MISSING_MSG_TYPE.into())
        })?;
        let error = || field::<String>(map, keys::ERROR);

        let message = match msg_type.as_str() {
            "ClientInit" => HandshakeMessage::ClientInit {
                client_version: required(map, keys::CLIENT_VERSION)?,
                build_date: field(map, keys::CLIENT_DATE).unwrap_or_default(),
                features: features_of(map, keys::FEATURES),
            },
            "ClientInitAck" => HandshakeMessage::ClientInitAck {
                core_features: features_of(map, keys::CORE_FEATURES),
                backend_info: field(map, keys::STORAGE_BACKENDS).unwrap_or_default(),
                authenticator_info: field(map, keys::AUTHENTICATORS).unwrap_or_default(),
                core_configured: field(map, keys::CONFIGURED),
            },
            "ClientInitReject" => HandshakeMessage::ClientInitReject { error: error() },
            "ClientLogin" => HandshakeMessage::ClientLogin {
                user: required(map, keys::USER)?,
                password: required(map, keys::PASSWORD)?,
            },
            "ClientLoginAck" => HandshakeMessage::ClientLoginAck,
            "ClientLoginReject" => HandshakeMessage::ClientLoginReject { error: error() },
            "CoreSetupData" => {
                let data: QVariantMap = required(map, keys::SETUP_DATA)?;
                HandshakeMessage::CoreSetupData {
                    admin_user: required(&data, keys::ADMIN_USER)?,
                    admin_password: required(&data, keys::ADMIN_PASSWD)?,
                    backend: field(&data, keys::BACKEND).unwrap_or_default(),
                    setup_data: field(&data, keys::CONNECTION_PROPERTIES).unwrap_or_default(),
                    authenticator: field(&data, keys::AUTHENTICATOR).unwrap_or_default(),
                    auth_setup_data: field(&data, keys::AUTH_PROPERTIES).unwrap_or_default(),
                }
            }
            "CoreSetupAck" => HandshakeMessage::CoreSetupAck,
            "CoreSetupReject" => HandshakeMessage::CoreSetupReject { error: error() },
            "SessionInit" => {
                let state: QVariantMap = required(map, keys::SESSION_STATE)?;
                HandshakeMessage::SessionInit {
                    identities: optional(&state, keys::IDENTITIES)?,
                    buffer_infos: optional(&state, keys::BUFFER_INFOS)?,
                    network_ids: optional(&state, keys::NETWORK_IDS)?,
                }
            }
            other => return Err(ProtocolError::UnexpectedMessage(other.to_owned())),
        };
        Ok(message)
    }

    /// Encode as a frame payload.
    pub fn serialize(&self, registry: &SerializerRegistry, features: &FeatureSet) -> Result<Bytes> {
        let fields = self.to_fields();
        let mut buf = BytesMut::with_capacity(256);
        write_count(&mut buf, fields.len() * 2)?;
        for (key, value) in &fields {
            registry.serialize(&mut buf, &QVariant::byte_string(key), features)?;
            registry.serialize(&mut buf, value, features)?;
        }
        Ok(buf.freeze())
    }

    /// Decode a frame payload. Keys may be `QByteArray` or `QString`.
    pub fn deserialize(
        mut payload: Bytes,
        registry: &SerializerRegistry,
        features: &FeatureSet,
    ) -> Result<Self> {
        let list = registry.deserialize_list(&mut payload, features)?;
        if list.len() % 2 != 0 {
            return Err(ProtocolError::MalformedValue(
                constants::ERR_ODD_HANDSHAKE_LIST.into(),
            ));
        }
        let mut map = QVariantMap::new();
        let mut items = list.into_iter();
        while let (Some(key), Some(value)) = (items.next(), items.next()) {
            let key = key
                .as_byte_string()
                .or_else(|| key.get::<String>())
                .ok_or_else(|| {
                    ProtocolError::MalformedValue(format!(
                        "handshake key of type {} is not a string",
                        key.tag()
                    ))
                })?;
            map.insert(key, value);
        }
        Self::from_map(&map)
    }
}
