use crate::error::{Error, Result};
use crate::store::DirectoryStore;
use crate::types::{GroupId, OrgId, SubjectRef, UserId, Username};
use std::collections::BTreeSet;

/// Identity token of a resolved subject.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum SubjectToken {
    User(UserId),
    Group(GroupId),
}

/// Subject expanded to its canonical user id and direct groups.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedSubject {
    pub user: UserId,
    pub username: Username,
    pub groups: BTreeSet<GroupId>,
}

impl ResolvedSubject {
    /// Returns every identity token: the user first, then its groups.
    pub fn tokens(&self) -> impl Iterator<Item = SubjectToken> + '_ {
        std::iter::once(SubjectToken::User(self.user.clone()))
            .chain(self.groups.iter().cloned().map(SubjectToken::Group))
    }
}

/// Resolves `subject` within `org`.
///
/// Group membership is read from the group side so a stale back-reference on
/// the user record cannot widen the token set. Groups do not nest.
pub async fn resolve_subject<S>(store: &S, org: &OrgId, subject: &SubjectRef) -> Result<ResolvedSubject>
where
    S: DirectoryStore + Sync + ?Sized,
{
    let user = match subject {
        SubjectRef::Id(id) => store.user(org.clone(), id.clone()).await?,
        SubjectRef::Username(name) => store.user_by_username(org.clone(), name.clone()).await?,
    }
    .ok_or_else(|| Error::not_found("subject", subject))?;

    let groups = store
        .groups_with_user(org.clone(), user.id.clone())
        .await?
        .into_iter()
        .collect();

    tracing::trace!(org = %org, user = %user.id, "subject resolved");
    Ok(ResolvedSubject {
        user: user.id,
        username: user.username,
        groups,
    })
}
