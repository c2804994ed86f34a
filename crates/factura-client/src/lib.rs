pub mod drive;
pub mod llm;
pub mod parser;
pub mod sheets;

pub use drive::DriveDiscovery;
pub use llm::OpenAiStructurer;
pub use parser::ParseServiceClient;
pub use sheets::SheetsLookup;
