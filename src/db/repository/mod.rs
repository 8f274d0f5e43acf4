pub mod application_repository;
pub mod notification_repository;
pub mod template_repository;
pub mod user_repository;

pub use application_repository::ApplicationRepository;
pub use notification_repository::{CreateNotification, NotificationRepository};
pub use template_repository::TemplateRepository;
pub use user_repository::UserRepository;
