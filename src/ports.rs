//! Well-known AMS ports of TwinCAT services.

use crate::AmsPort;

pub const LOGGER: AmsPort = 100;
pub const EVENT_LOGGER: AmsPort = 110;
pub const IO: AmsPort = 300;
pub const SPECIAL_TASK_1: AmsPort = 301;
pub const SPECIAL_TASK_2: AmsPort = 302;
pub const NC: AmsPort = 500;
/// TwinCAT 2 PLC runtimes.
pub const TC2_PLC_1: AmsPort = 801;
pub const TC2_PLC_2: AmsPort = 811;
pub const TC2_PLC_3: AmsPort = 821;
pub const TC2_PLC_4: AmsPort = 831;
/// First TwinCAT 3 PLC runtime.
pub const TC3_PLC_1: AmsPort = 851;
pub const TC3_PLC_2: AmsPort = 852;
pub const TC3_PLC_3: AmsPort = 853;
pub const TC3_PLC_4: AmsPort = 854;
pub const CAM_CONTROLLER: AmsPort = 900;
/// The system service, which handles routes, files and the device state.
pub const SYSTEM_SERVICE: AmsPort = 10000;
pub const SCOPE: AmsPort = 14000;

/// Source port used when none is requested from the router.
pub(crate) const DEFAULT_SOURCE: AmsPort = 58913;
