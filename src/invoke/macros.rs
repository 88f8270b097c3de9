/// Declare an interface that can be called remotely.
///
/// Every method is `async`, takes `&self` and owned arguments, and returns
/// `Result<Ret>` in the generated trait (`Result<()>` when no return type is
/// written). Argument and return types must implement serde's `Serialize`
/// and `DeserializeOwned`.
///
/// The macro generates the trait itself, an implementation for
/// [`Proxy<dyn Trait>`](crate::invoke::Proxy) that forwards each call over a
/// [`Sender`](crate::rpc::Sender), and a
/// [`RemoteInterface`](crate::invoke::RemoteInterface) implementation for
/// `dyn Trait` used by [`serve`](crate::invoke::serve).
///
/// Methods are identified on the wire by their name and parameter types.
/// `#[wire = "name"]` gives several methods one wire name, which works as
/// long as their parameter types differ.
///
/// ```ignore
/// remux::remote_interface! {
///     pub trait Greeter {
///         async fn echo(&self, text: String) -> String;
///         #[wire = "echo"]
///         async fn echo_all(&self, text: String, rest: Vec<String>) -> String;
///         async fn reset(&self);
///     }
/// }
/// ```
#[macro_export]
macro_rules! remote_interface {
    (
        $(#[$meta:meta])*
        $vis:vis trait $name:ident {
            $(
                $(#[doc = $doc:literal])*
                $(#[wire = $wire:literal])?
                async fn $method:ident(&self $(, $arg:ident : $ty:ty)* $(,)?) $(-> $ret:ty)?;
            )*
        }
    ) => {
        $(#[$meta])*
        #[$crate::async_trait]
        $vis trait $name: Send + Sync + 'static {
            $(
                $(#[doc = $doc])*
                async fn $method(&self $(, $arg: $ty)*)
                    -> $crate::Result<$crate::__remote_return!($($ret)?)>;
            )*
        }

        #[$crate::async_trait]
        impl<C> $name for $crate::invoke::Proxy<dyn $name, C>
        where
            C: $crate::codec::Codec + Clone + Unpin + 'static,
        {
            $(
                async fn $method(&self $(, $arg: $ty)*)
                    -> $crate::Result<$crate::__remote_return!($($ret)?)>
                {
                    let args: Vec<Vec<u8>> = vec![$(self.encode_arg(&$arg)?),*];
                    self.invoke(
                        $crate::__remote_wire!($($wire)? ; $method),
                        &[$(stringify!($ty)),*],
                        args,
                    )
                    .await
                }
            )*
        }

        impl $crate::invoke::RemoteInterface for dyn $name {
            fn dispatch_table<C>(
                target: ::std::sync::Arc<Self>,
                codec: C,
            ) -> $crate::invoke::DispatchTable
            where
                C: $crate::codec::Codec + Clone + 'static,
            {
                let mut table = $crate::invoke::DispatchTable::new();
                $(
                    {
                        let target = target.clone();
                        table.insert(
                            codec.clone(),
                            $crate::__remote_wire!($($wire)? ; $method),
                            &[$(stringify!($ty)),*],
                            move |mut args: $crate::invoke::Arguments<C>| {
                                let target = target.clone();
                                async move {
                                    $(let $arg: $ty = args.decode_next()?;)*
                                    args.finish()?;
                                    target.$method($($arg),*).await
                                }
                            },
                        );
                    }
                )*
                table
            }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __remote_return {
    () => { () };
    ($ret:ty) => { $ret };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __remote_wire {
    ($wire:literal ; $method:ident) => { $wire };
    (; $method:ident) => { stringify!($method) };
}
