pub use watermelon_proto as proto;

mod atomic;
mod client;
mod connection_status;
mod error;
mod handler;
mod multiplexed_subscription;
mod runtime;
mod server_pool;
mod statistics;
mod subscription;
#[cfg(test)]
pub(crate) mod tests;

pub mod core {
    //! NATS Core functionality implementation

    pub use crate::client::{Callbacks, Client, ClientBuilder, Echo, QuickInfo, SharedSubscription};
    pub use crate::connection_status::ConnectionStatus;
    pub(crate) use crate::multiplexed_subscription::MultiplexedSubscription;
    pub use crate::runtime::DeliveryModel;
    pub use crate::statistics::StatisticsSnapshot;
    pub use crate::subscription::Subscription;
    pub use watermelon_mini::AuthenticationMethod;

    pub mod publish {
        //! Utilities for publishing messages

        pub use crate::client::{
            ClientPublish, DoClientPublish, DoOwnedClientPublish, OwnedClientPublish, Publish,
            PublishBuilder, PublishError,
        };
    }

    pub mod request {
        //! Utilities for publishing messages and awaiting for a response

        pub use crate::client::{
            ClientRequest, DoClientRequest, DoOwnedClientRequest, OwnedClientRequest, Request,
            RequestBuilder, RequestError, ResponseFut,
        };
    }

    pub mod error {
        //! NATS Core specific errors

        pub use crate::client::{
            ClientClosedError, PublishError, RequestError, ResponseError, TryCommandError,
        };
        pub use crate::error::{last_error, with_last_error_scope, Error, ErrorKind};
    }
}
