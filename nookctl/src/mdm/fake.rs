//! In-memory [`MdmClient`] used by coordinator and HTTP tests.
//!
//! Keeps the external resource graph (groups, profiles, links, enrollments) in memory with the same
//! idempotency rules as the real client, counts calls per operation and lets a test queue
//! failures for the next call of a given operation.

use super::{Enrollment, ExternalServiceError, GroupLink, MdmClient, Result};
use crate::content::ContentBlob;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeProfile {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Default)]
struct FakeState {
    next_id: u64,
    groups: BTreeMap<String, String>,
    profiles: BTreeMap<String, FakeProfile>,
    /// (profile_ref, group_ref)
    group_links: BTreeSet<(String, String)>,
    /// (profile_ref, device_ref)
    device_links: BTreeSet<(String, String)>,
    /// enrollment_ref -> group_ref
    enrollments: BTreeMap<String, String>,
    /// (device_ref, message)
    locks: Vec<(String, String)>,
    deleted_devices: Vec<String>,
    calls: HashMap<&'static str, usize>,
    failures: HashMap<&'static str, VecDeque<ExternalServiceError>>,
}

impl FakeState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Count the call and pop a queued failure, if any.
    fn enter(&mut self, operation: &'static str) -> Result<()> {
        *self.calls.entry(operation).or_default() += 1;
        match self.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn not_found(what: &str, id: &str) -> ExternalServiceError {
    ExternalServiceError::from_status(404, format!("{what} {id} not found"), None)
}

#[derive(Debug, Default)]
pub struct FakeMdm {
    state: Mutex<FakeState>,
}

impl FakeMdm {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next call to `operation` fail with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, operation: &'static str, error: ExternalServiceError) {
        self.lock().failures.entry(operation).or_default().push_back(error);
    }

    /// Number of calls made to `operation`, including failed ones.
    pub fn calls(&self, operation: &str) -> usize {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn profile_count(&self) -> usize {
        self.lock().profiles.len()
    }

    pub fn profile(&self, profile_ref: &str) -> Option<FakeProfile> {
        self.lock().profiles.get(profile_ref).cloned()
    }

    pub fn group_name(&self, group_ref: &str) -> Option<String> {
        self.lock().groups.get(group_ref).cloned()
    }

    pub fn has_group(&self, group_ref: &str) -> bool {
        self.lock().groups.contains_key(group_ref)
    }

    pub fn is_linked(&self, profile_ref: &str, group_ref: &str) -> bool {
        self.lock().group_links.contains(&(profile_ref.to_string(), group_ref.to_string()))
    }

    pub fn is_linked_to_device(&self, profile_ref: &str, device_ref: &str) -> bool {
        self.lock().device_links.contains(&(profile_ref.to_string(), device_ref.to_string()))
    }

    /// Group an enrollment places devices into, while the enrollment exists.
    pub fn enrollment_group(&self, enrollment_ref: &str) -> Option<String> {
        self.lock().enrollments.get(enrollment_ref).cloned()
    }

    pub fn enrollment_count(&self) -> usize {
        self.lock().enrollments.len()
    }

    /// Lock requests in the order they were sent, as (device_ref, message).
    pub fn locks(&self) -> Vec<(String, String)> {
        self.lock().locks.clone()
    }

    pub fn deleted_devices(&self) -> Vec<String> {
        self.lock().deleted_devices.clone()
    }

    /// Simulate an edit made directly in the MDM console.
    pub fn remove_link_out_of_band(&self, profile_ref: &str, group_ref: &str) {
        self.lock().group_links.remove(&(profile_ref.to_string(), group_ref.to_string()));
    }
}

#[async_trait]
impl MdmClient for FakeMdm {
    async fn create_group(&self, name: &str) -> Result<String> {
        let mut state = self.lock();
        state.enter("create_group")?;
        let id = state.next("grp");
        state.groups.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn rename_group(&self, group_ref: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.enter("rename_group")?;
        match state.groups.get_mut(group_ref) {
            Some(existing) => {
                *existing = name.to_string();
                Ok(())
            }
            None => Err(not_found("device group", group_ref)),
        }
    }

    async fn delete_group(&self, group_ref: &str) -> Result<()> {
        let mut state = self.lock();
        state.enter("delete_group")?;
        state.groups.remove(group_ref);
        state.group_links.retain(|(_, g)| g != group_ref);
        Ok(())
    }

    async fn create_profile(&self, name: &str, content: &ContentBlob) -> Result<String> {
        let mut state = self.lock();
        state.enter("create_profile")?;
        let id = state.next("prf");
        state.profiles.insert(
            id.clone(),
            FakeProfile {
                name: name.to_string(),
                content: content.as_str().to_string(),
            },
        );
        Ok(id)
    }

    async fn update_profile(&self, profile_ref: &str, name: &str, content: &ContentBlob) -> Result<()> {
        let mut state = self.lock();
        state.enter("update_profile")?;
        match state.profiles.get_mut(profile_ref) {
            Some(profile) => {
                profile.name = name.to_string();
                profile.content = content.as_str().to_string();
                Ok(())
            }
            None => Err(not_found("profile", profile_ref)),
        }
    }

    async fn delete_profile(&self, profile_ref: &str) -> Result<()> {
        let mut state = self.lock();
        state.enter("delete_profile")?;
        state.profiles.remove(profile_ref);
        state.group_links.retain(|(p, _)| p != profile_ref);
        state.device_links.retain(|(p, _)| p != profile_ref);
        Ok(())
    }

    async fn link_profile_to_group(&self, profile_ref: &str, group_ref: &str) -> Result<String> {
        let mut state = self.lock();
        state.enter("link_profile_to_group")?;
        if !state.profiles.contains_key(profile_ref) {
            return Err(not_found("profile", profile_ref));
        }
        if !state.groups.contains_key(group_ref) {
            return Err(not_found("device group", group_ref));
        }
        state.group_links.insert((profile_ref.to_string(), group_ref.to_string()));
        Ok(format!("{group_ref}/{profile_ref}"))
    }

    async fn unlink_profile_from_group(&self, profile_ref: &str, group_ref: &str) -> Result<()> {
        let mut state = self.lock();
        state.enter("unlink_profile_from_group")?;
        state.group_links.remove(&(profile_ref.to_string(), group_ref.to_string()));
        Ok(())
    }

    async fn link_profile_to_device(&self, profile_ref: &str, device_ref: &str) -> Result<String> {
        let mut state = self.lock();
        state.enter("link_profile_to_device")?;
        if !state.profiles.contains_key(profile_ref) {
            return Err(not_found("profile", profile_ref));
        }
        state.device_links.insert((profile_ref.to_string(), device_ref.to_string()));
        Ok(format!("{device_ref}/{profile_ref}"))
    }

    async fn unlink_profile_from_device(&self, profile_ref: &str, device_ref: &str) -> Result<()> {
        let mut state = self.lock();
        state.enter("unlink_profile_from_device")?;
        state.device_links.remove(&(profile_ref.to_string(), device_ref.to_string()));
        Ok(())
    }

    async fn list_group_links(&self, group_ref: &str) -> Result<Vec<GroupLink>> {
        let mut state = self.lock();
        state.enter("list_group_links")?;
        if !state.groups.contains_key(group_ref) {
            return Err(not_found("device group", group_ref));
        }
        Ok(state
            .group_links
            .iter()
            .filter(|(_, g)| g == group_ref)
            .map(|(p, g)| GroupLink {
                profile_ref: p.clone(),
                link_id: format!("{g}/{p}"),
            })
            .collect())
    }

    async fn create_enrollment(&self, group_ref: &str) -> Result<Enrollment> {
        let mut state = self.lock();
        state.enter("create_enrollment")?;
        if !state.groups.contains_key(group_ref) {
            return Err(not_found("device group", group_ref));
        }
        let enrollment_ref = state.next("enr");
        state.enrollments.insert(enrollment_ref.clone(), group_ref.to_string());
        Ok(Enrollment {
            url: format!("https://mdm.test/enroll/?c={enrollment_ref}"),
            enrollment_ref,
        })
    }

    async fn delete_enrollment(&self, enrollment_ref: &str) -> Result<()> {
        let mut state = self.lock();
        state.enter("delete_enrollment")?;
        state.enrollments.remove(enrollment_ref);
        Ok(())
    }

    async fn lock_device(&self, device_ref: &str, message: &str) -> Result<()> {
        let mut state = self.lock();
        state.enter("lock_device")?;
        state.locks.push((device_ref.to_string(), message.to_string()));
        Ok(())
    }

    async fn delete_device(&self, device_ref: &str) -> Result<()> {
        let mut state = self.lock();
        state.enter("delete_device")?;
        state.device_links.retain(|(_, d)| d != device_ref);
        state.deleted_devices.push(device_ref.to_string());
        Ok(())
    }
}
