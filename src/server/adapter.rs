//! Turns callbacks of 0, 1 or 2 parameters into one uniform dispatcher.
//!
//! The declared parameter count is looked at once, when the callback is
//! adapted. The result is a [`Dispatcher`] that always takes
//! `(&Request, &ConnInfo)` and forwards only what the callback declared, so
//! the per-request path never branches on arity.
//!
//! Two ways to declare arity:
//!
//! - Plain closures. `Fn()`, `Fn(&Request)` and `Fn(&Request, &ConnInfo)`
//!   are told apart at compile time through the marker parameter of
//!   [`IntoCallback`].
//! - Types implementing [`Handler`]. They report their count through
//!   [`Handler::declared_arity`] and receive their arguments as [`Args`].
//!
//! ```
//! use arity_bench::{adapter::{adapt, Arity}, ConnInfo, Request};
//!
//! let zero = adapt(|| "hello world").unwrap();
//! let one = adapt(|_: &Request| "hello world").unwrap();
//! let two = adapt(|_: &Request, _: &ConnInfo| "hello world").unwrap();
//!
//! assert_eq!(zero.arity(), Arity::Zero);
//! assert_eq!(one.arity(), Arity::One);
//! assert_eq!(two.arity(), Arity::Two);
//! ```

use crate::{
    errors::Error,
    http::{
        request::{ConnInfo, Request},
        response::{IntoResponse, Response},
    },
};
use std::{fmt, sync::Arc};

/// The uniform calling convention the listener uses for every request.
pub type Dispatcher = Arc<dyn Fn(&Request, &ConnInfo) -> Response + Send + Sync>;

/// Number of positional parameters a callback declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arity {
    Zero,
    One,
    Two,
}

impl Arity {
    #[inline]
    pub const fn count(self) -> usize {
        match self {
            Arity::Zero => 0,
            Arity::One => 1,
            Arity::Two => 2,
        }
    }
}

impl TryFrom<usize> for Arity {
    type Error = Error;

    #[inline]
    fn try_from(declared: usize) -> Result<Self, Self::Error> {
        match declared {
            0 => Ok(Arity::Zero),
            1 => Ok(Arity::One),
            2 => Ok(Arity::Two),
            _ => Err(Error::InvalidArity { declared }),
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.count())
    }
}

/// Arguments delivered to a [`Handler`], exactly as many as it declared.
#[derive(Debug, Clone, Copy)]
pub enum Args<'a> {
    Zero,
    One(&'a Request),
    Two(&'a Request, &'a ConnInfo),
}

impl<'a> Args<'a> {
    /// Number of arguments carried.
    #[inline]
    pub const fn len(&self) -> usize {
        match self {
            Args::Zero => 0,
            Args::One(_) => 1,
            Args::Two(..) => 2,
        }
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Args::Zero)
    }

    #[inline]
    pub const fn request(&self) -> Option<&'a Request> {
        match self {
            Args::Zero => None,
            Args::One(request) | Args::Two(request, _) => Some(*request),
        }
    }

    #[inline]
    pub const fn conn_info(&self) -> Option<&'a ConnInfo> {
        match self {
            Args::Two(_, info) => Some(*info),
            _ => None,
        }
    }
}

/// A callback that states its own parameter count.
///
/// [`declared_arity`](Handler::declared_arity) is called once, when the
/// handler is registered. Values outside `0..=2` fail registration with
/// [`Error::InvalidArity`].
///
/// # Examples
/// ```
/// use arity_bench::{adapter::{adapt, Args, Handler}, Error};
///
/// struct Greeter;
///
/// impl Handler for Greeter {
///     type Output = String;
///
///     fn declared_arity(&self) -> usize {
///         1
///     }
///
///     fn call(&self, args: Args<'_>) -> String {
///         let target = args.request().map_or("?", |req| req.target());
///         format!("hello {target}")
///     }
/// }
///
/// struct TooMany;
///
/// impl Handler for TooMany {
///     type Output = &'static str;
///
///     fn declared_arity(&self) -> usize {
///         3
///     }
///
///     fn call(&self, _: Args<'_>) -> &'static str {
///         unreachable!()
///     }
/// }
///
/// assert!(adapt(Greeter).is_ok());
/// assert!(matches!(adapt(TooMany), Err(Error::InvalidArity { declared: 3 })));
/// ```
pub trait Handler: Send + Sync + 'static {
    type Output: IntoResponse;

    /// Number of positional parameters, not counting any rest parameter.
    fn declared_arity(&self) -> usize;

    fn call(&self, args: Args<'_>) -> Self::Output;
}

/// Marker for `Fn() -> R` callbacks.
pub struct NoArgs;
/// Marker for `Fn(&Request) -> R` callbacks.
pub struct WithRequest;
/// Marker for `Fn(&Request, &ConnInfo) -> R` callbacks.
pub struct WithConnInfo;
/// Marker for [`Handler`] implementors.
pub struct Declared;

/// Anything that can be registered as a request callback.
///
/// The type parameter `M` only selects the impl and is inferred.
pub trait IntoCallback<M>: Send + Sync + 'static {
    /// The parameter count, inspected once per registration.
    fn declared_arity(&self) -> usize;

    /// Builds the dispatcher that passes exactly `arity` arguments.
    fn specialize(self, arity: Arity) -> Dispatcher;
}

impl<F, R> IntoCallback<NoArgs> for F
where
    F: Fn() -> R + Send + Sync + 'static,
    R: IntoResponse,
{
    #[inline]
    fn declared_arity(&self) -> usize {
        0
    }

    fn specialize(self, _: Arity) -> Dispatcher {
        Arc::new(move |_: &Request, _: &ConnInfo| self().into_response())
    }
}

impl<F, R> IntoCallback<WithRequest> for F
where
    F: Fn(&Request) -> R + Send + Sync + 'static,
    R: IntoResponse,
{
    #[inline]
    fn declared_arity(&self) -> usize {
        1
    }

    fn specialize(self, _: Arity) -> Dispatcher {
        Arc::new(move |request: &Request, _: &ConnInfo| self(request).into_response())
    }
}

impl<F, R> IntoCallback<WithConnInfo> for F
where
    F: Fn(&Request, &ConnInfo) -> R + Send + Sync + 'static,
    R: IntoResponse,
{
    #[inline]
    fn declared_arity(&self) -> usize {
        2
    }

    fn specialize(self, _: Arity) -> Dispatcher {
        Arc::new(move |request: &Request, info: &ConnInfo| self(request, info).into_response())
    }
}

impl<H: Handler> IntoCallback<Declared> for H {
    #[inline]
    fn declared_arity(&self) -> usize {
        Handler::declared_arity(self)
    }

    fn specialize(self, arity: Arity) -> Dispatcher {
        match arity {
            Arity::Zero => Arc::new(move |_: &Request, _: &ConnInfo| {
                self.call(Args::Zero).into_response()
            }),
            Arity::One => Arc::new(move |request: &Request, _: &ConnInfo| {
                self.call(Args::One(request)).into_response()
            }),
            Arity::Two => Arc::new(move |request: &Request, info: &ConnInfo| {
                self.call(Args::Two(request, info)).into_response()
            }),
        }
    }
}

/// A callback whose arity has been checked and whose dispatcher is built.
#[derive(Clone)]
pub struct Adapted {
    arity: Arity,
    dispatcher: Dispatcher,
}

impl Adapted {
    #[inline(always)]
    pub const fn arity(&self) -> Arity {
        self.arity
    }

    /// Invokes the callback with the arguments it declared.
    #[inline(always)]
    pub fn dispatch(&self, request: &Request, info: &ConnInfo) -> Response {
        (self.dispatcher)(request, info)
    }

    #[inline]
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }
}

impl fmt::Debug for Adapted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapted")
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// Inspects the callback's arity and selects its dispatcher.
///
/// Fails with [`Error::InvalidArity`] when the callback declares more than
/// two parameters.
pub fn adapt<C, M>(callback: C) -> Result<Adapted, Error>
where
    C: IntoCallback<M>,
{
    let arity = Arity::try_from(callback.declared_arity())?;

    Ok(Adapted {
        arity,
        dispatcher: callback.specialize(arity),
    })
}
