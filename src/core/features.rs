//! # Feature Negotiation
//!
//! Optional protocol capabilities agreed on during the handshake. Older cores
//! only understand the 16-bit legacy bitmask, newer ones exchange a list of
//! feature names. A [`FeatureSet`] holds both views and keeps names it does
//! not understand so they can be echoed back unchanged.

use std::collections::BTreeSet;
use std::fmt;

/// A named protocol capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QuasselFeature {
    SynchronizedMarkerLine,
    SaslAuthentication,
    SaslExternal,
    HideInactiveNetworks,
    PasswordChange,
    CapNegotiation,
    VerifyServerSSL,
    CustomRateLimits,
    DccFileTransfer,
    AwayFormatTimestamp,
    Authenticators,
    BufferActivitySync,
    CoreSideHighlights,
    SenderPrefixes,
    RemoteDisconnect,
    ExtendedFeatures,
    LongTime,
    RichMessages,
    BacklogFilterType,
    EcdsaCertfpKeys,
    LongMessageId,
    SyncedCoreInfo,
}

impl QuasselFeature {
    pub const ALL: [QuasselFeature; 22] = [
        QuasselFeature::SynchronizedMarkerLine,
        QuasselFeature::SaslAuthentication,
        QuasselFeature::SaslExternal,
        QuasselFeature::HideInactiveNetworks,
        QuasselFeature::PasswordChange,
        QuasselFeature::CapNegotiation,
        QuasselFeature::VerifyServerSSL,
        QuasselFeature::CustomRateLimits,
        QuasselFeature::DccFileTransfer,
        QuasselFeature::AwayFormatTimestamp,
        QuasselFeature::Authenticators,
        QuasselFeature::BufferActivitySync,
        QuasselFeature::CoreSideHighlights,
        QuasselFeature::SenderPrefixes,
        QuasselFeature::RemoteDisconnect,
        QuasselFeature::ExtendedFeatures,
        QuasselFeature::LongTime,
        QuasselFeature::RichMessages,
        QuasselFeature::BacklogFilterType,
        QuasselFeature::EcdsaCertfpKeys,
        QuasselFeature::LongMessageId,
        QuasselFeature::SyncedCoreInfo,
    ];

    /// Name exchanged in the `FeatureList` handshake field.
    pub fn name(self) -> &'static str {
        match self {
            QuasselFeature::SynchronizedMarkerLine => "SynchronizedMarkerLine",
            QuasselFeature::SaslAuthentication => "SaslAuthentication",
            QuasselFeature::SaslExternal => "SaslExternal",
            QuasselFeature::HideInactiveNetworks => "HideInactiveNetworks",
            QuasselFeature::PasswordChange => "PasswordChange",
            QuasselFeature::CapNegotiation => "CapNegotiation",
            QuasselFeature::VerifyServerSSL => "VerifyServerSSL",
            QuasselFeature::CustomRateLimits => "CustomRateLimits",
            QuasselFeature::DccFileTransfer => "DccFileTransfer",
            QuasselFeature::AwayFormatTimestamp => "AwayFormatTimestamp",
            QuasselFeature::Authenticators => "Authenticators",
            QuasselFeature::BufferActivitySync => "BufferActivitySync",
            QuasselFeature::CoreSideHighlights => "CoreSideHighlights",
            QuasselFeature::SenderPrefixes => "SenderPrefixes",
            QuasselFeature::RemoteDisconnect => "RemoteDisconnect",
            QuasselFeature::ExtendedFeatures => "ExtendedFeatures",
            QuasselFeature::LongTime => "LongTime",
            QuasselFeature::RichMessages => "RichMessages",
            QuasselFeature::BacklogFilterType => "BacklogFilterType",
            QuasselFeature::EcdsaCertfpKeys => "EcdsaCertfpKeys",
            QuasselFeature::LongMessageId => "LongMessageId",
            QuasselFeature::SyncedCoreInfo => "SyncedCoreInfo",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }

    /// Bit in the legacy `Features` mask, if this feature predates the name list.
    pub fn legacy_bit(self) -> Option<u32> {
        let bit = match self {
            QuasselFeature::SynchronizedMarkerLine => 0x0001,
            QuasselFeature::SaslAuthentication => 0x0002,
            QuasselFeature::SaslExternal => 0x0004,
            QuasselFeature::HideInactiveNetworks => 0x0008,
            QuasselFeature::PasswordChange => 0x0010,
            QuasselFeature::CapNegotiation => 0x0020,
            QuasselFeature::VerifyServerSSL => 0x0040,
            QuasselFeature::CustomRateLimits => 0x0080,
            QuasselFeature::DccFileTransfer => 0x0100,
            QuasselFeature::AwayFormatTimestamp => 0x0200,
            QuasselFeature::Authenticators => 0x0400,
            QuasselFeature::BufferActivitySync => 0x0800,
            QuasselFeature::CoreSideHighlights => 0x1000,
            QuasselFeature::SenderPrefixes => 0x2000,
            QuasselFeature::RemoteDisconnect => 0x4000,
            QuasselFeature::ExtendedFeatures => 0x8000,
            _ => return None,
        };
        Some(bit)
    }
}

impl fmt::Display for QuasselFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable set of negotiated features.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeatureSet {
    features: BTreeSet<QuasselFeature>,
    additional: BTreeSet<String>,
}

impl FeatureSet {
    /// Combine a legacy bitmask with a list of feature names.
    ///
    /// Names without a known feature are kept in the additional set.
    pub fn build<I, S>(legacy: u32, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut features: BTreeSet<QuasselFeature> = QuasselFeature::ALL
            .iter()
            .copied()
            .filter(|f| f.legacy_bit().is_some_and(|bit| legacy & bit != 0))
            .collect();
        let mut additional = BTreeSet::new();
        for name in names {
            let name = name.as_ref();
            match QuasselFeature::from_name(name) {
                Some(feature) => {
                    features.insert(feature);
                }
                None => {
                    additional.insert(name.to_owned());
                }
            }
        }
        Self {
            features,
            additional,
        }
    }

    pub fn from_features<I: IntoIterator<Item = QuasselFeature>>(features: I) -> Self {
        Self {
            features: features.into_iter().collect(),
            additional: BTreeSet::new(),
        }
    }

    pub fn all() -> Self {
        Self::from_features(QuasselFeature::ALL)
    }

    pub fn none() -> Self {
        Self::default()
    }

    #[inline]
    pub fn has_feature(&self, feature: QuasselFeature) -> bool {
        self.features.contains(&feature)
    }

    /// Known feature names followed by the additional ones.
    pub fn feature_list(&self) -> Vec<String> {
        self.features
            .iter()
            .map(|f| f.name().to_owned())
            .chain(self.additional.iter().cloned())
            .collect()
    }

    /// The legacy bitmask for cores that ignore the name list.
    pub fn legacy_features(&self) -> u32 {
        self.features
            .iter()
            .filter_map(|f| f.legacy_bit())
            .fold(0, |acc, bit| acc | bit)
    }

    pub fn additional(&self) -> impl Iterator<Item = &str> {
        self.additional.iter().map(String::as_str)
    }

    /// Features both peers support. Additional names are dropped since neither
    /// side can act on them.
    pub fn intersect(&self, other: &FeatureSet) -> FeatureSet {
        Self {
            features: self.features.intersection(&other.features).copied().collect(),
            additional: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_merges_legacy_and_names() {
        let set = FeatureSet::build(0x0001 | 0x2000, ["LongTime", "FancyFutureThing"]);
        assert!(set.has_feature(QuasselFeature::SynchronizedMarkerLine));
        assert!(set.has_feature(QuasselFeature::SenderPrefixes));
        assert!(set.has_feature(QuasselFeature::LongTime));
        assert!(!set.has_feature(QuasselFeature::RichMessages));
        assert_eq!(set.additional().collect::<Vec<_>>(), vec!["FancyFutureThing"]);
        assert!(set.feature_list().contains(&"FancyFutureThing".to_string()));
    }

    #[test]
    fn legacy_mask_only_covers_legacy_features() {
        assert_eq!(FeatureSet::all().legacy_features(), 0xffff);
        assert_eq!(FeatureSet::none().legacy_features(), 0);
        let set = FeatureSet::from_features([QuasselFeature::LongMessageId]);
        assert_eq!(set.legacy_features(), 0);
    }

    #[test]
    fn intersect_keeps_common_features() {
        let client = FeatureSet::all();
        let core = FeatureSet::build(0x8000, ["LongTime", "Unknown"]);
        let negotiated = client.intersect(&core);
        assert!(negotiated.has_feature(QuasselFeature::LongTime));
        assert!(negotiated.has_feature(QuasselFeature::ExtendedFeatures));
        assert!(!negotiated.has_feature(QuasselFeature::LongMessageId));
        assert_eq!(negotiated.additional().count(), 0);
    }
}
