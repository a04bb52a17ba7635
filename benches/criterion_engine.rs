#![cfg(all(
    feature = "criterion-bench",
    feature = "memory-store",
    feature = "memory-cache"
))]

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use futures::executor::block_on;
use tenant_authz::{
    Action, ActionId, CheckRequestWithPermissions, EngineBuilder, GroupId, GroupPatchRequest,
    MemoryCache, MemoryStore, OrgId, Organization, Permission, PermissionPatchRequest, Resource,
    ResourceId, RoleId, RoleUpdateRequest, SubjectRef, TupleRequest, User, UserId, Username,
};
use std::time::Duration;

struct Fixture {
    store: MemoryStore,
    org: OrgId,
    subject: SubjectRef,
    action: ActionId,
    resource: ResourceId,
}

fn organization(store: &MemoryStore, name: &str) -> (OrgId, UserId) {
    let org = OrgId::try_from(name).unwrap();
    let user = UserId::try_from("user_bench").unwrap();
    store
        .create_organization(Organization::new(org.clone(), name, format!("{name}-key")))
        .unwrap();
    store
        .create_user(
            &org,
            User::new(user.clone(), Username::try_from("bench").unwrap()),
        )
        .unwrap();
    (org, user)
}

fn declare(store: &MemoryStore, org: &OrgId, resource: &str, actions: &[&str]) -> ResourceId {
    let id = ResourceId::try_from(resource).unwrap();
    let resource = actions.iter().fold(Resource::new(id.clone(), resource), |res, action| {
        res.with_action(Action::new(ActionId::try_from(*action).unwrap(), *action))
    });
    store.create_resource(org, resource).unwrap();
    id
}

fn setup_direct_role() -> Fixture {
    let store = MemoryStore::new();
    let (org, user) = organization(&store, "org_bench");
    let resource = declare(&store, &org, "invoice", &["read", "approve", "archive"]);
    let role = RoleId::try_from("role_reader").unwrap();
    store.create_role(&org, role.clone(), "Reader").unwrap();

    let engine = EngineBuilder::new(store.clone()).build();
    block_on(engine.patch_permissions(
        org.clone(),
        role.clone(),
        PermissionPatchRequest {
            added_permissions: vec![Permission::parse("invoice:read").unwrap()],
            removed_permissions: Vec::new(),
        },
    ))
    .unwrap();
    block_on(engine.update_role(
        org.clone(),
        role,
        RoleUpdateRequest {
            added_users: vec![user],
            ..RoleUpdateRequest::default()
        },
    ))
    .unwrap();

    Fixture {
        store,
        org,
        subject: SubjectRef::username("bench").unwrap(),
        action: ActionId::try_from("read").unwrap(),
        resource,
    }
}

fn setup_group_fanout(group_count: usize) -> Fixture {
    let store = MemoryStore::new();
    let (org, user) = organization(&store, "org_group_bench");
    let resource = declare(&store, &org, "invoice", &["read"]);
    let engine = EngineBuilder::new(store.clone()).build();

    for i in 0..group_count {
        let group = GroupId::try_from(format!("group_{i}").as_str()).unwrap();
        store.create_group(&org, group.clone(), "Group").unwrap();
        block_on(engine.patch_group(
            org.clone(),
            group.clone(),
            GroupPatchRequest {
                added_users: vec![user.clone()],
                removed_users: Vec::new(),
            },
        ))
        .unwrap();
        let role = RoleId::try_from(format!("role_{i}").as_str()).unwrap();
        store.create_role(&org, role.clone(), "Role").unwrap();
        block_on(engine.update_role(
            org.clone(),
            role,
            RoleUpdateRequest {
                added_groups: vec![group],
                ..RoleUpdateRequest::default()
            },
        ))
        .unwrap();
    }

    let last = RoleId::try_from(format!("role_{}", group_count - 1).as_str()).unwrap();
    block_on(engine.patch_permissions(
        org.clone(),
        last,
        PermissionPatchRequest {
            added_permissions: vec![Permission::parse("invoice:read").unwrap()],
            removed_permissions: Vec::new(),
        },
    ))
    .unwrap();

    Fixture {
        store,
        org,
        subject: SubjectRef::username("bench").unwrap(),
        action: ActionId::try_from("read").unwrap(),
        resource,
    }
}

fn setup_tuples(tuple_count: usize) -> Fixture {
    let store = MemoryStore::new();
    let (org, _) = organization(&store, "org_tuple_bench");
    let engine = EngineBuilder::new(store.clone()).build();
    let action = ActionId::try_from("read").unwrap();

    for i in 0..tuple_count {
        let resource = declare(&store, &org, &format!("doc_{i}"), &["read"]);
        block_on(engine.create_tuple(
            org.clone(),
            TupleRequest::new(SubjectRef::username("bench").unwrap(), action.clone(), resource),
        ))
        .unwrap();
    }

    Fixture {
        store,
        org,
        subject: SubjectRef::username("bench").unwrap(),
        action,
        resource: ResourceId::try_from(format!("doc_{}", tuple_count - 1).as_str()).unwrap(),
    }
}

fn bench_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_direct_role");
    group.sample_size(30);
    group.throughput(Throughput::Elements(1));

    let f = setup_direct_role();
    let engine = EngineBuilder::new(f.store).build();
    group.bench_function("check_no_cache", |b| {
        b.iter(|| {
            let allowed = block_on(engine.check(
                f.org.clone(),
                f.subject.clone(),
                f.action.clone(),
                f.resource.clone(),
            ))
            .unwrap();
            black_box(allowed);
        });
    });

    for shards in [1usize, 8] {
        let f = setup_direct_role();
        let cache = MemoryCache::new(8_192)
            .with_shards(shards)
            .with_ttl(Duration::from_secs(60));
        let engine = EngineBuilder::new(f.store).cache(cache).build();
        assert!(
            block_on(engine.check(
                f.org.clone(),
                f.subject.clone(),
                f.action.clone(),
                f.resource.clone(),
            ))
            .unwrap()
        );
        group.bench_function(format!("check_cache_shards{shards}"), |b| {
            b.iter(|| {
                let allowed = block_on(engine.check(
                    f.org.clone(),
                    f.subject.clone(),
                    f.action.clone(),
                    f.resource.clone(),
                ))
                .unwrap();
                black_box(allowed);
            });
        });
    }

    group.finish();
}

fn bench_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_batch");
    group.sample_size(30);
    group.throughput(Throughput::Elements(3));

    let f = setup_direct_role();
    let engine = EngineBuilder::new(f.store)
        .cache(MemoryCache::new(8_192).with_shards(8))
        .build();
    let request = CheckRequestWithPermissions {
        subject: f.subject.clone(),
        resource: f.resource.clone(),
        actions: ["read", "approve", "archive"]
            .into_iter()
            .map(|action| ActionId::try_from(action).unwrap())
            .collect(),
    };
    group.bench_function("check_permissions_three_actions", |b| {
        b.iter(|| {
            let results = block_on(engine.check_permissions(f.org.clone(), request.clone())).unwrap();
            black_box(results);
        });
    });

    group.finish();
}

fn bench_group_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_group_fanout");
    group.sample_size(30);
    group.throughput(Throughput::Elements(1));

    for group_count in [1usize, 8, 32, 128] {
        let f = setup_group_fanout(group_count);
        let engine = EngineBuilder::new(f.store).build();

        let id = BenchmarkId::from_parameter(group_count);
        group.bench_with_input(id, &group_count, |b, _| {
            b.iter(|| {
                let allowed = block_on(engine.check(
                    f.org.clone(),
                    f.subject.clone(),
                    f.action.clone(),
                    f.resource.clone(),
                ))
                .unwrap();
                black_box(allowed);
            });
        });
    }

    group.finish();
}

fn bench_listings(c: &mut Criterion) {
    let mut group = c.benchmark_group("listings");
    group.sample_size(30);
    group.throughput(Throughput::Elements(1));

    for tuple_count in [8usize, 128] {
        let f = setup_tuples(tuple_count);
        let engine = EngineBuilder::new(f.store).cache_listings(false).build();

        group.bench_with_input(
            BenchmarkId::new("objects_for_subject", tuple_count),
            &tuple_count,
            |b, _| {
                b.iter(|| {
                    let objects = block_on(engine.objects_for_subject(
                        f.org.clone(),
                        f.subject.clone(),
                        f.action.clone(),
                    ))
                    .unwrap();
                    black_box(objects);
                });
            },
        );
        group.bench_with_input(
            BenchmarkId::new("subjects_for_object", tuple_count),
            &tuple_count,
            |b, _| {
                b.iter(|| {
                    let subjects = block_on(engine.subjects_for_object(
                        f.org.clone(),
                        f.resource.clone(),
                        f.action.clone(),
                    ))
                    .unwrap();
                    black_box(subjects);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_check,
    bench_batch,
    bench_group_fanout,
    bench_listings
);
criterion_main!(benches);
