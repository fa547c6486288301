use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};

use crate::{CodecError, RpcControllerPtr};

/// One service method as the schema compiler describes it.
pub struct MethodDescriptor {
    pub name: &'static str,
    /// Overrides the service default when set. Milliseconds.
    pub timeout_ms: Option<u64>,
}

/// What the framework needs from a generated service: its identity, its
/// methods with timeout annotations, and the raw schema file for
/// introspection.
pub struct ServiceDescriptor {
    pub full_name: &'static str,
    pub methods: &'static [MethodDescriptor],
    pub default_timeout_ms: Option<u64>,
    pub file: &'static str,
}

impl ServiceDescriptor {
    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Method annotation over service default; both absent means the
    /// call runs without a timer.
    pub fn timeout_for(&self, method: &MethodDescriptor) -> Option<Duration> {
        method
            .timeout_ms
            .or(self.default_timeout_ms)
            .map(Duration::from_millis)
    }
}

/// Completion handed to a service implementation; `None` bytes mean the
/// controller was failed instead.
pub type RpcDoneCallback = Box<dyn FnOnce(&RpcControllerPtr, Option<Vec<u8>>) + Send>;

/// Server-side face of a generated service.
///
/// `call_method` parses the request bytes (failing the controller with
/// `ParseFail` when they don't parse), runs the implementation, and
/// reports through `done` with the serialised response.
pub trait Service: Send + Sync + 'static {
    fn descriptor(&self) -> &'static ServiceDescriptor;

    fn call_method(
        &self,
        method: &MethodDescriptor,
        controller: RpcControllerPtr,
        request: &[u8],
        done: RpcDoneCallback,
    );
}

/// Payload encoding the generated code uses on both sides of the wire.
pub fn encode_payload<T: Serialize>(value: &T) -> Vec<u8> {
    bitcode::serialize(value).expect("payload serialise")
}

pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bitcode::deserialize(bytes).map_err(|_| CodecError::ParseFail)
}

#[cfg(test)]
mod tests {
    use super::*;

    static METHODS: &[MethodDescriptor] = &[
        MethodDescriptor { name: "Fast", timeout_ms: Some(100) },
        MethodDescriptor { name: "Default", timeout_ms: None },
    ];
    static DESCRIPTOR: ServiceDescriptor = ServiceDescriptor {
        full_name: "test.Timeouts",
        methods: METHODS,
        default_timeout_ms: Some(2000),
        file: "",
    };
    static BARE: ServiceDescriptor = ServiceDescriptor {
        full_name: "test.Bare",
        methods: METHODS,
        default_timeout_ms: None,
        file: "",
    };

    #[test]
    fn method_timeout_overrides_service_default() {
        let fast = DESCRIPTOR.method("Fast").unwrap();
        assert_eq!(DESCRIPTOR.timeout_for(fast), Some(Duration::from_millis(100)));
        let default = DESCRIPTOR.method("Default").unwrap();
        assert_eq!(DESCRIPTOR.timeout_for(default), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn absent_everywhere_means_no_timer() {
        let default = BARE.method("Default").unwrap();
        assert_eq!(BARE.timeout_for(default), None);
        assert!(BARE.method("Missing").is_none());
    }

    #[test]
    fn payload_round_trip() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Echo {
            text: String,
        }
        let bytes = encode_payload(&Echo { text: "hi".into() });
        let back: Echo = decode_payload(&bytes).unwrap();
        assert_eq!(back.text, "hi");
        assert!(decode_payload::<Echo>(&[0xff, 0xfe, 0x01]).is_err());
    }
}
