use crate::instrument::InstrumentKey;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use uuid::Uuid;

/// Full-mode subscription request sent (as a binary frame) right after the transport opens.
///
/// ### Raw Payload Example
/// ```json
/// {
///     "guid": "4f1c6a8e-...",
///     "method": "sub",
///     "data": {
///         "mode": "full",
///         "instrumentKeys": ["NSE_EQ|INE002A01018", "NSE_INDEX|Nifty 50"]
///     }
/// }
/// ```
#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct SubscriptionRequest {
    pub guid: Uuid,
    pub method: SmolStr,
    pub data: SubscriptionData,
}

#[derive(Clone, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct SubscriptionData {
    pub mode: SmolStr,
    #[serde(rename = "instrumentKeys")]
    pub instrument_keys: Vec<InstrumentKey>,
}

impl SubscriptionRequest {
    /// Construct a `"sub"` request in `"full"` mode with a fresh request id.
    pub fn full<'a>(keys: impl IntoIterator<Item = &'a InstrumentKey>) -> Self {
        Self {
            guid: Uuid::new_v4(),
            method: SmolStr::new_static("sub"),
            data: SubscriptionData {
                mode: SmolStr::new_static("full"),
                instrument_keys: keys.into_iter().cloned().collect(),
            },
        }
    }
}
