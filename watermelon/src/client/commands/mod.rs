pub use self::publish::{
    ClientPublish, DoClientPublish, DoOwnedClientPublish, OwnedClientPublish, Publish,
    PublishBuilder, PublishError,
};
pub use self::request::{
    ClientRequest, DoClientRequest, DoOwnedClientRequest, OwnedClientRequest, Request,
    RequestBuilder, RequestError, ResponseError, ResponseFut,
};

mod publish;
mod request;
