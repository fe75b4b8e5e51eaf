//! Named IMISC stubs over [`RosClient`].
//!
//! Every operation gets a blocking method (`utc_time`) and a callback method
//! (`utc_time_with`) that forward to the generic invoker.

use std::sync::Arc;

use remop_core::imisc::{
    self, CharGen, Data, Echo, Empty, Finger, GenTime, Ia5List, Ping, PwdGen, Qotd, Sink,
    TellUser, TimeOfDay, Users, UtcTime,
};
use remop_core::{InvokeId, RemoteOperation};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::ToSocketAddrs;

use super::{ClientConfig, CompletionHandlers, InvokeError, RosClient};

/// Declares a blocking and a callback stub per operation. Operations whose
/// argument is `Empty` take no argument.
macro_rules! imisc_stubs {
    (@arg) => { &Empty };
    (@arg $arg:ident) => { $arg };
    (
        $(
            $(#[$meta:meta])*
            $op:ident: $blocking:ident, $callback:ident $(($arg:ident: $ty:ty))?;
        )*
    ) => {
        $(
            $(#[$meta])*
            ///
            /// # Errors
            ///
            /// Any [`InvokeError`]; remote IMISC errors decode with
            /// [`InvokeError::imisc`].
            pub async fn $blocking(
                &self
                $(, $arg: &$ty)?
            ) -> Result<<$op as RemoteOperation>::Result, InvokeError> {
                self.ros.invoke::<$op>(imisc_stubs!(@arg $($arg)?)).await
            }

            #[doc = concat!("Callback form of [`", stringify!($blocking), "`](Self::", stringify!($blocking), ").")]
            ///
            /// # Errors
            ///
            /// Errors raised before the invoke is queued; later ones go to
            /// `handlers`.
            pub async fn $callback(
                &self
                $(, $arg: &$ty)?,
                handlers: CompletionHandlers<<$op as RemoteOperation>::Result>,
            ) -> Result<InvokeId, InvokeError> {
                self.ros
                    .invoke_with::<$op>(imisc_stubs!(@arg $($arg)?), handlers)
                    .await
            }
        )*
    };
}

/// IMISC invoker.
pub struct ImiscClient {
    ros: RosClient,
}

impl ImiscClient {
    /// Starts an IMISC session over an established byte stream.
    pub fn connect<T>(io: T, config: ClientConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            ros: RosClient::connect(io, Arc::new(imisc::table().clone()), config),
        }
    }

    /// Connects to an IMISC performer over TCP.
    ///
    /// # Errors
    ///
    /// Returns `InvokeError::Connect` if the connection cannot be made.
    pub async fn connect_tcp(addr: impl ToSocketAddrs, config: ClientConfig) -> Result<Self, InvokeError> {
        let ros = RosClient::connect_tcp(addr, Arc::new(imisc::table().clone()), config).await?;
        Ok(Self { ros })
    }

    /// The underlying generic invoker.
    #[must_use]
    pub fn ros(&self) -> &RosClient {
        &self.ros
    }

    pub async fn close(&self) {
        self.ros.close().await;
    }

    imisc_stubs! {
        /// Current time as a UTCTime string.
        UtcTime: utc_time, utc_time_with;
        /// Current time as seconds since 1900.
        TimeOfDay: time_of_day, time_of_day_with;
        /// Users logged in on the performer.
        Users: users, users_with;
        /// One block of character-generator lines.
        CharGen: char_gen, char_gen_with;
        /// Quote of the day.
        Qotd: qotd, qotd_with;
        /// Information about `users`; an empty list asks about everyone.
        Finger: finger, finger_with(users: Ia5List);
        /// A set of generated passwords.
        PwdGen: pwd_gen, pwd_gen_with;
        /// Current time as a GeneralizedTime string.
        GenTime: gen_time, gen_time_with;
        /// Sends `message` (recipient first, then lines).
        TellUser: tell_user, tell_user_with(message: Ia5List);
        Ping: ping, ping_with;
        /// Sends `data` to be discarded.
        Sink: sink, sink_with(data: Data);
        /// Sends `data` and gets it back.
        Echo: echo, echo_with(data: Data);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use remop_core::{decode_payload, encode_payload, Pdu, ResultPdu};

    use super::*;
    use crate::session::{framed, SessionConfig};

    /// Answers one invocation with `reply(argument)` and returns the operation invoked.
    async fn answer_once(
        remote: tokio::io::DuplexStream,
        reply: impl FnOnce(&[u8]) -> Vec<u8>,
    ) -> remop_core::OperationCode {
        let mut peer = framed(remote, &SessionConfig::default());
        let frame = peer.next().await.unwrap().unwrap();
        let Pdu::Invoke(inv) = Pdu::from_bytes(&frame).unwrap() else {
            panic!("expected invoke");
        };
        let response = Pdu::ReturnResult(ResultPdu {
            invoke_id: inv.invoke_id,
            operation: Some(inv.operation),
            result: reply(&inv.argument),
        });
        peer.send(Bytes::from(response.to_bytes().unwrap())).await.unwrap();
        // Keep the stream open until the client has read the response.
        let _ = peer.next().await;
        inv.operation
    }

    #[tokio::test]
    async fn finger_sends_names_and_decodes_reply() {
        let (local, remote) = tokio::io::duplex(16 * 1024);
        let performer = tokio::spawn(answer_once(remote, |arg| {
            let names: Ia5List = decode_payload(arg).unwrap();
            let lines = Ia5List::lossy(names.iter().map(|n| format!("{n}: on since boot")));
            encode_payload(&lines).unwrap()
        }));

        let client = ImiscClient::connect(local, ClientConfig::default());
        let reply = client.finger(&Ia5List::lossy(["alice"])).await.unwrap();
        assert_eq!(reply.as_slice(), ["alice: on since boot".to_string()]);

        client.close().await;
        assert_eq!(performer.await.unwrap(), Finger::CODE);
    }

    #[tokio::test]
    async fn callback_stub_delivers_to_result_handler() {
        let (local, remote) = tokio::io::duplex(16 * 1024);
        let performer = tokio::spawn(answer_once(remote, |_| encode_payload(&Empty).unwrap()));

        let client = ImiscClient::connect(local, ClientConfig::default());
        let (handlers, rx) = CompletionHandlers::channel();
        let id = client.ping_with(handlers).await.unwrap();
        assert_eq!(id, InvokeId(1));
        assert_eq!(rx.await.unwrap().unwrap(), Empty);

        client.close().await;
        assert_eq!(performer.await.unwrap(), Ping::CODE);
    }
}
