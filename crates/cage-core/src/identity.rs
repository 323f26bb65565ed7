//! Fixed identity values substituted into fingerprinting getters so the
//! device under analysis never leaks real identifiers to the sample. The
//! values are deterministic: repeated runs of the same sample are directly
//! comparable.

pub const MOCK_TM_DEVICEID: &str = "358240051111110";
pub const MOCK_TM_IMEI: &str = "358240051111110";
pub const MOCK_TM_MEID: &str = "35824005111111";
pub const MOCK_TM_SUBSCRIBERID: &str = "310260000000000";
pub const MOCK_TM_SIMSERIALNUMBER: &str = "89014103211118510720";
pub const MOCK_TM_SIMOPERATOR: &str = "310260";
pub const MOCK_TM_SIMOPERATORNAME: &str = "Verizon";
pub const MOCK_TM_SIMCOUNTRYISO: &str = "us";
pub const MOCK_TM_NETWORKOPERATOR: &str = "310260";
pub const MOCK_TM_NETWORKOPERATORNAME: &str = "Verizon";
pub const MOCK_TM_NETWORKCOUNTRYISO: &str = "us";
pub const MOCK_TM_DEVICESOFTWAREVERSION: &str = "01";
pub const MOCK_WIFI_MACADDRESS: &str = "02:00:5e:a1:64:3b";

/// Mock value for a telephony getter, selected by the method-name suffix
/// after `get`. Unknown getters mask to the empty string rather than
/// leaking through.
pub fn telephony_mock(method: &str) -> &'static str {
    let suffix = method.strip_prefix("get").unwrap_or(method);
    match suffix.to_ascii_uppercase().as_str() {
        "DEVICEID" => MOCK_TM_DEVICEID,
        "IMEI" => MOCK_TM_IMEI,
        "MEID" => MOCK_TM_MEID,
        "SUBSCRIBERID" => MOCK_TM_SUBSCRIBERID,
        "SIMSERIALNUMBER" => MOCK_TM_SIMSERIALNUMBER,
        "SIMOPERATOR" => MOCK_TM_SIMOPERATOR,
        "SIMOPERATORNAME" => MOCK_TM_SIMOPERATORNAME,
        "SIMCOUNTRYISO" => MOCK_TM_SIMCOUNTRYISO,
        "NETWORKOPERATOR" => MOCK_TM_NETWORKOPERATOR,
        "NETWORKOPERATORNAME" => MOCK_TM_NETWORKOPERATORNAME,
        "NETWORKCOUNTRYISO" => MOCK_TM_NETWORKCOUNTRYISO,
        "DEVICESOFTWAREVERSION" => MOCK_TM_DEVICESOFTWAREVERSION,
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_getters_resolve_by_suffix() {
        assert_eq!(telephony_mock("getDeviceId"), MOCK_TM_DEVICEID);
        assert_eq!(telephony_mock("getSubscriberId"), MOCK_TM_SUBSCRIBERID);
        assert_eq!(telephony_mock("getSimOperatorName"), MOCK_TM_SIMOPERATORNAME);
    }

    #[test]
    fn unknown_getter_masks_to_empty() {
        assert_eq!(telephony_mock("getCallState"), "");
    }
}
