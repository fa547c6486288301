use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::{
    MethodDescriptor, RpcControllerPtr, RpcDoneCallback, RpcError, Service, ServiceDescriptor,
    decode_payload, encode_payload,
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HeartBeatRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartBeatResponse {
    pub status: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServicesRequest {}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceName {
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServicesResponse {
    pub services: Vec<ServiceName>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetFileSetRequest {
    pub names: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaFile {
    pub name: String,
    pub content: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetFileSetResponse {
    pub file_set: Vec<SchemaFile>,
}

static BUILTIN_METHODS: &[MethodDescriptor] = &[
    MethodDescriptor { name: "HeartBeat", timeout_ms: Some(3000) },
    MethodDescriptor { name: "Services", timeout_ms: None },
    MethodDescriptor { name: "GetFileSet", timeout_ms: None },
];

pub static BUILTIN_SERVICE: ServiceDescriptor = ServiceDescriptor {
    full_name: "strand.rpc.BuiltinService",
    methods: BUILTIN_METHODS,
    default_timeout_ms: Some(5000),
    file: "\
service BuiltinService {\n\
  rpc HeartBeat (HeartBeatRequest) returns (HeartBeatResponse);\n\
  rpc Services (ServicesRequest) returns (ServicesResponse);\n\
  rpc GetFileSet (GetFileSetRequest) returns (GetFileSetResponse);\n\
}\n",
};

/// Framework-internal service: liveness, registry enumeration, and raw
/// schema files so clients can build invocation UIs without ahead-of-
/// time knowledge.
#[derive(Default)]
pub struct BuiltinService {
    /// `(full_name, file)` of every registered service, snapshotted by
    /// the server at start.
    services: Mutex<Vec<(String, &'static str)>>,
}

impl BuiltinService {
    pub fn set_services(&self, services: Vec<(String, &'static str)>) {
        *self.services.lock().unwrap() = services;
    }

    fn heart_beat(&self, _request: &HeartBeatRequest) -> HeartBeatResponse {
        HeartBeatResponse { status: "Ok".to_owned() }
    }

    fn services(&self, _request: &ServicesRequest) -> ServicesResponse {
        let services = self.services.lock().unwrap();
        ServicesResponse {
            services: services
                .iter()
                .filter(|(name, _)| name != BUILTIN_SERVICE.full_name)
                .map(|(name, _)| ServiceName { name: name.clone() })
                .collect(),
        }
    }

    fn get_file_set(&self, request: &GetFileSetRequest) -> GetFileSetResponse {
        let services = self.services.lock().unwrap();
        GetFileSetResponse {
            file_set: request
                .names
                .iter()
                .filter_map(|wanted| {
                    services.iter().find(|(name, _)| name == wanted).map(|(name, file)| SchemaFile {
                        name: name.clone(),
                        content: (*file).to_owned(),
                    })
                })
                .collect(),
        }
    }
}

impl Service for BuiltinService {
    fn descriptor(&self) -> &'static ServiceDescriptor {
        &BUILTIN_SERVICE
    }

    fn call_method(
        &self,
        method: &MethodDescriptor,
        controller: RpcControllerPtr,
        request: &[u8],
        done: RpcDoneCallback,
    ) {
        let response = match method.name {
            "HeartBeat" => decode_payload::<HeartBeatRequest>(request)
                .map(|req| encode_payload(&self.heart_beat(&req))),
            "Services" => decode_payload::<ServicesRequest>(request)
                .map(|req| encode_payload(&self.services(&req))),
            "GetFileSet" => decode_payload::<GetFileSetRequest>(request)
                .map(|req| encode_payload(&self.get_file_set(&req))),
            _ => {
                controller.set_failed(RpcError::InvalidMethod);
                done(&controller, None);
                return;
            }
        };
        match response {
            Ok(bytes) => done(&controller, Some(bytes)),
            Err(_) => {
                controller.set_failed(RpcError::ParseFail);
                done(&controller, None);
            }
        }
    }
}
