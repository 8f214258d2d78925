mod flutterwave;
mod mock;
mod paystack;

pub use flutterwave::FlutterwaveClient;
pub use mock::MockClient;
pub use paystack::PaystackClient;
