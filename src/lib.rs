mod aggregate;
mod app;
mod catalog;
mod cli;
mod crumpet;
mod error;
mod gear;
mod gesture;
mod idle;
mod protocol;
mod scheduler;
mod settings;
mod telemetry;
mod terminal;

pub use aggregate::{AggregateEntry, AggregationModel, CatalogEvent, spawn_aggregator};
pub use app::{
    fake_gear_transport, real_gear_transport, run, run_with_clients,
    run_with_clients_and_log_level, run_with_log_level,
};
pub use catalog::{CommandInfo, GearCatalog};
pub use cli::{Args, CatalogArgs, Command, FakeArgs, ListenArgs, LogLevel, ScanArgs, SendArgs};
pub use crumpet::{CommandFile, CommandFileError, load_builtin};
pub use error::{FixtureError, GearError, InteractionError};
pub use gear::{
    BatteryCharge, BatteryReporting, BtleplugTransport, FAKE_GEAR_LOCAL_NAME, FIRMWARE_CHUNK_SIZE,
    FakeGearConfig, FakeGearTransport, FakeNotificationInjector, FirmwareInfo, FoundGear,
    GearConnection, GearHandle, GearModel, GearNotification, GearOp, GearProfile, GearStatus,
    GearTransport, NotifySource, OtaError, OtaUpload, REBOOT_FALLBACK_TIMEOUT, ScanFixture,
    SessionCore, SessionEffect, SessionEvent, SessionState, SessionTimer, StatusUpdate,
    VerifiedFirmware, download_firmware, fetch_firmware_info, load_local_firmware,
    model_for_advertised_name, profile_for, spawn_session, verify_firmware,
};
pub use gesture::{
    AccelerometerSource, SampleBuffer, StepDetector, StepEvent, StepSampler, spawn_sampler,
};
pub use idle::{choose_fill, should_fill, spawn_idle_filler};
pub use protocol::{
    ChainReply, ChainStep, Dialect, ExpandedCall, MarkerReassembler, MarkerReply, expand_call,
    next_chain_step, parse_chain_reply,
};
pub use scheduler::{
    CommandDispatch, QueueEntry, QueueSnapshot, SchedulerCore, SchedulerEffect, SchedulerHandle,
    SchedulerOp, spawn_scheduler,
};
pub use settings::{Settings, SettingsStore, default_settings_path};
pub use terminal::TerminalClient;
