pub mod confirmation;
pub mod payment;
pub mod session_end;
pub mod supervisor;

pub use confirmation::ConfirmationSweeper;
pub use payment::PaymentSweeper;
pub use session_end::SessionEndSweeper;
pub use supervisor::SweeperSupervisor;
