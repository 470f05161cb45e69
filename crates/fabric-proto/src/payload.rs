//! JSON payload shapes carried in message bodies.

use serde::{Deserialize, Serialize};

/// Settings pushed to a provider on `SETUP_PROVIDER`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub limit: u32,
}

/// Opaque per-request info a client attaches to `REQ_KERNEL`; forwarded
/// untouched through `SPAWN_KERNEL` to the worker. The fabric never
/// interprets its contents.
pub type KernelInfo = serde_json::Value;

/// The full descriptor of a ready kernel, as returned to the client in
/// `RES_KERNEL` and as embedded in the worker's `READY_KERNEL` announcement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelDescriptor {
    pub kernel_id: String,
    pub session_key: String,
    pub ip: String,
    pub hb: u16,
    pub iopub: u16,
    pub shell: u16,
    pub process_key: String,
    pub process: u16,
}

/// Body of `READY_KERNEL`: worker -> provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyKernelBody {
    pub kernel_id: String,
    pub connection: KernelConnectionInfo,
}

/// The `connection` sub-object of `READY_KERNEL`, i.e. `KernelDescriptor`
/// minus the redundant outer `kernel_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelConnectionInfo {
    pub session_key: String,
    pub ip: String,
    pub hb: u16,
    pub iopub: u16,
    pub shell: u16,
    pub process_key: String,
    pub process: u16,
}

impl KernelDescriptor {
    pub fn from_ready(body: &ReadyKernelBody) -> Self {
        KernelDescriptor {
            kernel_id: body.kernel_id.clone(),
            session_key: body.connection.session_key.clone(),
            ip: body.connection.ip.clone(),
            hb: body.connection.hb,
            iopub: body.connection.iopub,
            shell: body.connection.shell,
            process_key: body.connection.process_key.clone(),
            process: body.connection.process,
        }
    }
}

/// Body of `REQ_FILE_SERVING`: sender -> receiver, opens a new flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqFileServingBody {
    pub remote_path: String,
}

/// Body of `RES_FILE_SERVING`: receiver -> sender, reports where it will
/// actually write the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResFileServingBody {
    pub actual_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_from_ready_copies_every_field() {
        let ready = ReadyKernelBody {
            kernel_id: "kernel-1".to_owned(),
            connection: KernelConnectionInfo {
                session_key: "deadbeef".to_owned(),
                ip: "127.0.0.1".to_owned(),
                hb: 9001,
                iopub: 9002,
                shell: 9003,
                process_key: "worker-1".to_owned(),
                process: 9004,
            },
        };

        let descriptor = KernelDescriptor::from_ready(&ready);

        assert_eq!(descriptor.kernel_id, "kernel-1");
        assert_eq!(descriptor.session_key, "deadbeef");
        assert_eq!(descriptor.ip, "127.0.0.1");
        assert_eq!(descriptor.hb, 9001);
        assert_eq!(descriptor.iopub, 9002);
        assert_eq!(descriptor.shell, 9003);
        assert_eq!(descriptor.process_key, "worker-1");
        assert_eq!(descriptor.process, 9004);
    }

    #[test]
    fn provider_settings_round_trip_json() {
        let settings = ProviderSettings { limit: 7 };
        let json = serde_json::to_value(&settings).unwrap();
        let back: ProviderSettings = serde_json::from_value(json).unwrap();
        assert_eq!(back.limit, 7);
    }
}
