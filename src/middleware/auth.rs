//! Auth layer: resolves a bearer token into a `UserIdentity` via the
//! configured provider and attaches it to the context.

use crate::auth::AuthProvider;
use crate::errors::RequestError;

use super::RequestContext;

pub async fn authenticate(provider: &dyn AuthProvider, ctx: &mut RequestContext) -> Result<(), RequestError> {
    let identity = provider.authenticate(ctx.bearer_token.as_deref()).await?;
    ctx.identity = Some(identity);
    Ok(())
}
