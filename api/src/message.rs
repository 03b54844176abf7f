// Licensed under the Apache-2.0 license

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bkps_error::{raise_err, BkpsResult};
use serde_derive::{Deserialize, Serialize};

/// Kind of a message handed to the programmer. Each kind owns one bit in
/// the programmer's supported-commands word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    SendPacket,
    /// Store the wrapped key as a file on the programmer host.
    PushWrappedKey,
    /// Store the wrapped key in flash at the USER IID PUF location.
    PushWrappedKeyUserIid,
    /// Store the wrapped key in flash at the UDS IID PUF location.
    PushWrappedKeyUdsIid,
    PushHelperDataUdsIid,
    PushHelperDataUdsIntel,
}

impl MessageType {
    pub fn bit(self) -> u32 {
        match self {
            MessageType::SendPacket => 0,
            MessageType::PushWrappedKey => 1,
            MessageType::PushWrappedKeyUserIid => 2,
            MessageType::PushWrappedKeyUdsIid => 3,
            MessageType::PushHelperDataUdsIid => 4,
            MessageType::PushHelperDataUdsIntel => 5,
        }
    }

    pub fn is_set_in(self, supported_commands: u32) -> bool {
        supported_commands & (1 << self.bit()) != 0
    }

    /// True if every type is supported. An empty list is trivially supported.
    pub fn are_set_in(types: &[MessageType], supported_commands: u32) -> bool {
        types.iter().all(|t| t.is_set_in(supported_commands))
    }

    /// True if any type is supported. An empty list is trivially supported.
    pub fn at_least_one_is_set_in(types: &[MessageType], supported_commands: u32) -> bool {
        types.is_empty() || types.iter().any(|t| t.is_set_in(supported_commands))
    }
}

/// A message the programmer forwards to the device (or stores locally,
/// depending on the type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgrammerMessage {
    pub message_type: MessageType,
    #[serde(with = "base64_value")]
    pub value: Vec<u8>,
}

impl ProgrammerMessage {
    pub fn new(message_type: MessageType, value: Vec<u8>) -> Self {
        Self {
            message_type,
            value,
        }
    }

    pub fn send_packet(value: Vec<u8>) -> Self {
        Self::new(MessageType::SendPacket, value)
    }

    pub fn encoded_value(&self) -> String {
        STANDARD.encode(&self.value)
    }
}

/// A raw device response relayed back by the programmer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgrammerResponse {
    #[serde(with = "base64_value")]
    pub value: Vec<u8>,
}

impl ProgrammerResponse {
    pub fn new(value: Vec<u8>) -> Self {
        Self { value }
    }

    pub fn from_base64(encoded: &str) -> BkpsResult<Self> {
        match STANDARD.decode(encoded) {
            Ok(value) => Ok(Self { value }),
            Err(e) => raise_err!(CODEC_INVALID_ENCODING, "Invalid programmer response: {e}"),
        }
    }
}

/// Hands out programmer responses in the order the commands were sent.
pub struct ProgrammerResponseAdapter<'a> {
    responses: &'a [ProgrammerResponse],
    position: usize,
}

impl<'a> ProgrammerResponseAdapter<'a> {
    pub fn new(responses: &'a [ProgrammerResponse]) -> Self {
        Self {
            responses,
            position: 0,
        }
    }

    /// Fails unless exactly `expected` responses were relayed.
    pub fn expecting(responses: &'a [ProgrammerResponse], expected: usize) -> BkpsResult<Self> {
        if responses.len() != expected {
            raise_err!(
                SIGMA_RESPONSE_COUNT_MISMATCH,
                "Expected {expected} programmer responses but received {}.",
                responses.len()
            );
        }
        Ok(Self::new(responses))
    }

    pub fn next_response(&mut self) -> BkpsResult<&'a [u8]> {
        let Some(response) = self.responses.get(self.position) else {
            raise_err!(
                SIGMA_RESPONSE_COUNT_MISMATCH,
                "Programmer response {} is missing.",
                self.position
            );
        };
        self.position += 1;
        Ok(&response.value)
    }
}

mod base64_value {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bkps_error::ErrorKind;

    #[test]
    fn test_message_type_bits() {
        let supported = 0b101;
        assert!(MessageType::SendPacket.is_set_in(supported));
        assert!(!MessageType::PushWrappedKey.is_set_in(supported));
        assert!(MessageType::PushWrappedKeyUserIid.is_set_in(supported));
        assert!(MessageType::are_set_in(
            &[MessageType::SendPacket, MessageType::PushWrappedKeyUserIid],
            supported
        ));
        assert!(!MessageType::are_set_in(
            &[MessageType::SendPacket, MessageType::PushWrappedKey],
            supported
        ));
        assert!(MessageType::at_least_one_is_set_in(
            &[MessageType::PushWrappedKey, MessageType::SendPacket],
            supported
        ));
        assert!(MessageType::at_least_one_is_set_in(&[], 0));
    }

    #[test]
    fn test_programmer_message_json() {
        let message = ProgrammerMessage::new(MessageType::PushWrappedKey, vec![1, 2, 3]);
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(json, r#"{"messageType":"PUSH_WRAPPED_KEY","value":"AQID"}"#);
        let parsed: ProgrammerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_adapter_counts_responses() {
        let responses = vec![ProgrammerResponse::new(vec![1]), ProgrammerResponse::new(vec![2])];
        assert_eq!(
            ProgrammerResponseAdapter::expecting(&responses, 3)
                .err()
                .map(|e| e.kind()),
            Some(ErrorKind::SIGMA_RESPONSE_COUNT_MISMATCH)
        );
        let mut adapter = ProgrammerResponseAdapter::expecting(&responses, 2).unwrap();
        assert_eq!(adapter.next_response().unwrap(), &[1]);
        assert_eq!(adapter.next_response().unwrap(), &[2]);
        assert!(adapter.next_response().is_err());
    }

    #[test]
    fn test_response_from_base64() {
        let response = ProgrammerResponse::from_base64("AAUAEA==").unwrap();
        assert_eq!(response.value, vec![0x00, 0x05, 0x00, 0x10]);
        assert!(ProgrammerResponse::from_base64("***").is_err());
    }
}
