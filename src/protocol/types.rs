//! Protocol message kinds and wire codes

/// Message kinds carried in the envelope header's `MessageType` integer.
///
/// Direction prefix: `Ds`/`Sd` device↔server, `Cs`/`Sc` client↔server.
/// The wire values must match the device firmware and are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    DsRegisterReq,
    SdRegisterAck,
    CsGetStreamReq,
    ScGetStreamAck,
    SdPushStreamReq,
    DsPushStreamAck,
    CsFreeStreamReq,
    ScFreeStreamAck,
    SdStreamStopReq,
    DsStreamStopAck,
    CsDeviceListReq,
    ScDeviceListAck,
    CsDeviceInfoReq,
    ScDeviceInfoAck,
    DsPostSnapReq,
    SdPostSnapAck,
    ScException,
}

impl MessageType {
    /// Wire integer for this kind.
    pub fn wire(self) -> i64 {
        match self {
            MessageType::DsRegisterReq => 0x0010,
            MessageType::SdRegisterAck => 0x0011,
            MessageType::CsGetStreamReq => 0x0020,
            MessageType::ScGetStreamAck => 0x0021,
            MessageType::SdPushStreamReq => 0x0022,
            MessageType::DsPushStreamAck => 0x0023,
            MessageType::CsFreeStreamReq => 0x0030,
            MessageType::ScFreeStreamAck => 0x0031,
            MessageType::SdStreamStopReq => 0x0032,
            MessageType::DsStreamStopAck => 0x0033,
            MessageType::CsDeviceListReq => 0x0040,
            MessageType::ScDeviceListAck => 0x0041,
            MessageType::CsDeviceInfoReq => 0x0042,
            MessageType::ScDeviceInfoAck => 0x0043,
            MessageType::DsPostSnapReq => 0x0050,
            MessageType::SdPostSnapAck => 0x0051,
            MessageType::ScException => 0x0FFF,
        }
    }

    /// Decode a wire integer.
    pub fn from_wire(value: i64) -> Option<Self> {
        let kind = match value {
            0x0010 => MessageType::DsRegisterReq,
            0x0011 => MessageType::SdRegisterAck,
            0x0020 => MessageType::CsGetStreamReq,
            0x0021 => MessageType::ScGetStreamAck,
            0x0022 => MessageType::SdPushStreamReq,
            0x0023 => MessageType::DsPushStreamAck,
            0x0030 => MessageType::CsFreeStreamReq,
            0x0031 => MessageType::ScFreeStreamAck,
            0x0032 => MessageType::SdStreamStopReq,
            0x0033 => MessageType::DsStreamStopAck,
            0x0040 => MessageType::CsDeviceListReq,
            0x0041 => MessageType::ScDeviceListAck,
            0x0042 => MessageType::CsDeviceInfoReq,
            0x0043 => MessageType::ScDeviceInfoAck,
            0x0050 => MessageType::DsPostSnapReq,
            0x0051 => MessageType::SdPostSnapAck,
            0x0FFF => MessageType::ScException,
            _ => return None,
        };
        Some(kind)
    }

    /// The response kind paired with a request kind; error envelopes echo it.
    /// Ack kinds pair with themselves, unknown requests with `ScException`.
    pub fn response_kind(self) -> MessageType {
        match self {
            MessageType::DsRegisterReq => MessageType::SdRegisterAck,
            MessageType::CsGetStreamReq => MessageType::ScGetStreamAck,
            MessageType::CsFreeStreamReq => MessageType::ScFreeStreamAck,
            MessageType::CsDeviceListReq => MessageType::ScDeviceListAck,
            MessageType::CsDeviceInfoReq => MessageType::ScDeviceInfoAck,
            MessageType::DsPostSnapReq => MessageType::SdPostSnapAck,
            MessageType::SdPushStreamReq => MessageType::DsPushStreamAck,
            MessageType::SdStreamStopReq => MessageType::DsStreamStopAck,
            other => other,
        }
    }
}

/// Device application type announced at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppType {
    Camera,
    Nvr,
}

impl AppType {
    pub fn as_str(self) -> &'static str {
        match self {
            AppType::Camera => "EasyCamera",
            AppType::Nvr => "EasyNVR",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "EasyCamera" => Some(AppType::Camera),
            "EasyNVR" => Some(AppType::Nvr),
            _ => None,
        }
    }
}

/// Envelope error numbers
pub mod codes {
    pub const SUCCESS_OK: i32 = 200;
    pub const CLIENT_BAD_REQUEST: i32 = 400;
    pub const CLIENT_UNAUTHORIZED: i32 = 401;
    pub const DEVICE_NOT_FOUND: i32 = 404;
    pub const REQUEST_TIMEOUT: i32 = 408;
    pub const CONFLICT: i32 = 409;
    pub const SERVER_INTERNAL_ERROR: i32 = 500;
    pub const SERVER_NOT_IMPLEMENTED: i32 = 501;
    pub const SERVICE_NOT_FOUND: i32 = 503;
}

/// Human-readable text for an envelope error number.
pub fn error_string(code: i32) -> &'static str {
    match code {
        codes::SUCCESS_OK => "Success OK",
        codes::CLIENT_BAD_REQUEST => "Client Bad Request",
        codes::CLIENT_UNAUTHORIZED => "Client Unauthorized",
        codes::DEVICE_NOT_FOUND => "Device Not Found",
        codes::REQUEST_TIMEOUT => "Request Timeout",
        codes::CONFLICT => "Name Already Exists",
        codes::SERVER_INTERNAL_ERROR => "Server Internal Error",
        codes::SERVER_NOT_IMPLEMENTED => "Server Not Implemented",
        codes::SERVICE_NOT_FOUND => "Service Not Found",
        _ => "Unknown Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let kinds = [
            MessageType::DsRegisterReq,
            MessageType::SdRegisterAck,
            MessageType::CsGetStreamReq,
            MessageType::ScGetStreamAck,
            MessageType::SdPushStreamReq,
            MessageType::DsPushStreamAck,
            MessageType::CsFreeStreamReq,
            MessageType::ScFreeStreamAck,
            MessageType::SdStreamStopReq,
            MessageType::DsStreamStopAck,
            MessageType::CsDeviceListReq,
            MessageType::ScDeviceListAck,
            MessageType::CsDeviceInfoReq,
            MessageType::ScDeviceInfoAck,
            MessageType::DsPostSnapReq,
            MessageType::SdPostSnapAck,
            MessageType::ScException,
        ];
        for kind in kinds {
            assert_eq!(MessageType::from_wire(kind.wire()), Some(kind));
        }
        assert_eq!(MessageType::from_wire(0), None);
        assert_eq!(MessageType::from_wire(0x7777), None);
    }

    #[test]
    fn request_response_pairing() {
        assert_eq!(
            MessageType::DsRegisterReq.response_kind(),
            MessageType::SdRegisterAck
        );
        assert_eq!(
            MessageType::CsGetStreamReq.response_kind(),
            MessageType::ScGetStreamAck
        );
        // acks pair with themselves; they are not normally answered
        assert_eq!(
            MessageType::DsPushStreamAck.response_kind(),
            MessageType::DsPushStreamAck
        );
    }

    #[test]
    fn app_type_strings() {
        assert_eq!(AppType::from_str("EasyCamera"), Some(AppType::Camera));
        assert_eq!(AppType::from_str("EasyNVR"), Some(AppType::Nvr));
        assert_eq!(AppType::from_str("EasyRouter"), None);
        assert_eq!(AppType::Nvr.as_str(), "EasyNVR");
    }

    #[test]
    fn unknown_error_code_has_fallback_text() {
        assert_eq!(error_string(777), "Unknown Error");
        assert_eq!(error_string(codes::SUCCESS_OK), "Success OK");
    }
}
