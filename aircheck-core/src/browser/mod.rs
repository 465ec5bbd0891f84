pub mod blockwall;
pub mod controller;
pub mod error;
pub mod fingerprint;
pub mod launcher;
pub mod profile;

pub use blockwall::{classify_content, scan_page, BlockCategory, BlockVerdict};
pub use controller::{PreparedCapture, SetupController};
pub use error::{BrowserError, BrowserResult};
pub use fingerprint::FingerprintMasker;
pub use launcher::{
    AutomationSession, BrowserAutomation, BrowserLauncher, CapturePage, SessionLauncher,
    SessionPage, ViewportSpec,
};
pub use profile::{BrowserProfile, ProfileManager};
