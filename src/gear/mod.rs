mod btleplug_backend;
mod fake_transport;
mod ota;
mod profile;
mod runner;
mod session;
mod transport;

pub use self::btleplug_backend::BtleplugTransport;
pub use self::fake_transport::{
    FakeGearConfig, FakeGearTransport, FakeNotificationInjector, ScanFixture,
};
pub use self::ota::{
    FIRMWARE_CHUNK_SIZE, FirmwareInfo, OtaError, OtaUpload, REBOOT_FALLBACK_TIMEOUT,
    VerifiedFirmware, download_firmware, fetch_firmware_info, load_local_firmware, verify_firmware,
};
pub use self::profile::{
    BatteryReporting, FAKE_GEAR_LOCAL_NAME, GearModel, GearProfile, model_for_advertised_name,
    profile_for,
};
pub use self::runner::{BatteryCharge, GearHandle, GearOp, GearStatus, spawn_session};
pub use self::session::{
    SessionCore, SessionEffect, SessionEvent, SessionState, SessionTimer, StatusUpdate,
};
pub use self::transport::{
    FoundGear, GearConnection, GearNotification, GearTransport, NotifySource,
};
