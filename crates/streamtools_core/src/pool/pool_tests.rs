#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use streamtools_platform::{ChatMessage, FollowEvent, RaidEvent, RedemptionEvent, TransportEvent};
use tokio::time::timeout;

use super::*;
use crate::test_support::{FakeFactory, FakeResolver, FakeTokens, account, channel, eventually};

fn pool_with(factory: Arc<FakeFactory>, resolver: Arc<FakeResolver>) -> ChatConnectionPool {
	ChatConnectionPool::new(factory, resolver, Arc::new(FakeTokens))
}

fn pool() -> (ChatConnectionPool, Arc<FakeFactory>, Arc<FakeResolver>) {
	let factory = Arc::new(FakeFactory::default());
	let resolver = Arc::new(FakeResolver::default());
	(pool_with(factory.clone(), resolver.clone()), factory, resolver)
}

fn counting_message(counter: &Arc<AtomicUsize>) -> Callback {
	let counter = Arc::clone(counter);
	Callback::message(move |_| {
		counter.fetch_add(1, Ordering::SeqCst);
		Ok(())
	})
}

fn chat(chan: &str, user: &str, text: &str) -> TransportEvent {
	TransportEvent::Message(ChatMessage::new(channel(chan), user, text))
}

#[tokio::test]
async fn two_callbacks_share_one_connection() {
	let (pool, factory, _) = pool();
	let hits = Arc::new(AtomicUsize::new(0));

	let a = pool
		.add_callback(&account("Cathy"), &channel("shroud"), counting_message(&hits))
		.await;
	let b = pool
		.add_callback(&account("cathy"), &channel("#Shroud"), counting_message(&hits))
		.await;

	assert!(a.is_some() && b.is_some());
	assert_ne!(a, b);
	assert_eq!(pool.len(), 1);
	assert_eq!(factory.count(), 1);
	assert!(eventually(|| factory.transport(0).connects.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test]
async fn concurrent_adds_create_one_connection() {
	let (pool, factory, _) = pool();
	let hits = Arc::new(AtomicUsize::new(0));

	let (acc_a, chan_a) = (account("cathy"), channel("shroud"));
	let (acc_b, chan_b) = (account("cathy"), channel("shroud"));
	let (a, b) = tokio::join!(
		pool.add_callback(&acc_a, &chan_a, counting_message(&hits)),
		pool.add_callback(&acc_b, &chan_b, counting_message(&hits)),
	);
	assert!(a.is_some() && b.is_some());
	assert_eq!(pool.len(), 1);
	assert_eq!(factory.count(), 1);
}

#[tokio::test]
async fn distinct_accounts_get_distinct_connections() {
	let (pool, factory, _) = pool();
	let hits = Arc::new(AtomicUsize::new(0));
	pool.add_callback(&account("cathy"), &channel("shroud"), counting_message(&hits))
		.await
		.unwrap();
	pool.add_callback(&account("bot2"), &channel("shroud"), counting_message(&hits))
		.await
		.unwrap();
	assert_eq!(pool.len(), 2);
	assert_eq!(factory.count(), 2);
}

#[tokio::test]
async fn unresolved_channel_or_account_is_a_no_op() {
	let (pool, factory, resolver) = pool();
	resolver.unknown.lock().insert("ghost".to_string());
	let hits = Arc::new(AtomicUsize::new(0));

	assert!(pool
		.add_callback(&account("cathy"), &channel("ghost"), counting_message(&hits))
		.await
		.is_none());
	assert!(pool
		.add_callback(&account("nobody"), &channel("shroud"), counting_message(&hits))
		.await
		.is_none());
	assert!(pool.is_empty());
	assert_eq!(factory.count(), 0);
}

#[tokio::test]
async fn removing_last_callback_tears_down_connection() {
	let (pool, factory, _) = pool();
	let hits = Arc::new(AtomicUsize::new(0));
	let (acct, chan) = (account("cathy"), channel("shroud"));

	let msg_id = pool.add_callback(&acct, &chan, counting_message(&hits)).await.unwrap();
	let raid_id = pool
		.add_callback(&acct, &chan, Callback::raid(|_| Ok(())))
		.await
		.unwrap();

	assert!(pool.remove_callback(&acct, &chan, CallbackSlot::Message, msg_id));
	assert_eq!(pool.len(), 1, "raid slot still populated");
	assert_eq!(factory.transport(0).disconnects.load(Ordering::SeqCst), 0);

	assert!(!pool.remove_callback(&acct, &chan, CallbackSlot::Message, raid_id), "wrong slot");
	assert_eq!(pool.len(), 1);

	assert!(pool.remove_callback(&acct, &chan, CallbackSlot::Raid, raid_id));
	assert!(pool.is_empty());
	let transport = factory.transport(0);
	assert!(eventually(|| transport.disconnects.load(Ordering::SeqCst) == 1).await);
	assert!(pool.get_connection_client(&chan).is_none());
}

#[tokio::test]
async fn is_connected_requires_a_joined_channel() {
	let (pool, factory, _) = pool();
	let hits = Arc::new(AtomicUsize::new(0));
	let (acct, chan) = (account("cathy"), channel("shroud"));
	pool.add_callback(&acct, &chan, counting_message(&hits)).await.unwrap();

	let transport = factory.transport(0);
	assert!(eventually(|| pool.is_connected(&acct, &chan)).await);

	transport.set_state(true, false);
	assert!(transport.is_connected());
	assert!(!pool.is_connected(&acct, &chan));

	transport.set_state(false, false);
	assert!(!pool.is_connected(&acct, &chan));
	assert!(!pool.is_connected(&account("other"), &chan));
}

#[tokio::test]
async fn admin_rejection_gates_message_callbacks() {
	let (pool, factory, _) = pool();
	let hits = Arc::new(AtomicUsize::new(0));
	let (acct, chan) = (account("cathy"), channel("shroud"));

	pool.add_callback(&acct, &chan, Callback::admin(|_, _| panic!("broken judge")))
		.await
		.unwrap();
	pool.add_callback(&acct, &chan, Callback::admin(|_, m| !m.text.contains("buy followers")))
		.await
		.unwrap();
	pool.add_callback(&acct, &chan, Callback::message(|_| anyhow::bail!("first subscriber fails")))
		.await
		.unwrap();
	pool.add_callback(&acct, &chan, counting_message(&hits)).await.unwrap();

	let transport = factory.transport(0);
	transport.emit(chat("shroud", "spammer", "buy followers now")).await;
	transport.emit(chat("shroud", "viewer", "hello")).await;

	assert!(eventually(|| hits.load(Ordering::SeqCst) == 1).await);
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn messages_are_delivered_in_order() {
	let (pool, factory, _) = pool();
	let seen = Arc::new(Mutex::new(Vec::new()));
	let sink = Arc::clone(&seen);
	pool.add_callback(
		&account("cathy"),
		&channel("shroud"),
		Callback::message(move |m| {
			sink.lock().push(m.text.clone());
			Ok(())
		}),
	)
	.await
	.unwrap();

	let transport = factory.transport(0);
	for i in 0..20 {
		transport.emit(chat("shroud", "viewer", &format!("m{i}"))).await;
	}
	assert!(eventually(|| seen.lock().len() == 20).await);
	let expected: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
	assert_eq!(*seen.lock(), expected);
}

#[tokio::test]
async fn raid_is_delivered_once_to_first_connection() {
	let (pool, factory, _) = pool();
	let first = Arc::new(AtomicUsize::new(0));
	let second = Arc::new(AtomicUsize::new(0));
	let (f, s) = (Arc::clone(&first), Arc::clone(&second));

	pool.add_callback(
		&account("cathy"),
		&channel("shroud"),
		Callback::raid(move |_| {
			f.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}),
	)
	.await
	.unwrap();
	pool.add_callback(
		&account("bot2"),
		&channel("shroud"),
		Callback::raid(move |_| {
			s.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}),
	)
	.await
	.unwrap();

	let raid = RaidEvent {
		channel: channel("shroud"),
		from_login: "raider".into(),
		from_display: "Raider".into(),
		viewers: 10,
	};
	factory.transport(0).emit(TransportEvent::Raid(raid.clone())).await;
	factory.transport(1).emit(TransportEvent::Raid(raid)).await;

	assert!(eventually(|| first.load(Ordering::SeqCst) == 1).await);
	tokio::time::sleep(Duration::from_millis(20)).await;
	assert_eq!(first.load(Ordering::SeqCst), 1);
	assert_eq!(second.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn follow_goes_to_first_match_and_redemption_to_all() {
	let (pool, _, _) = pool();
	let follows = Arc::new(AtomicUsize::new(0));
	let redemptions = Arc::new(AtomicUsize::new(0));

	for name in ["cathy", "bot2"] {
		let f = Arc::clone(&follows);
		let r = Arc::clone(&redemptions);
		pool.add_callback(
			&account(name),
			&channel("shroud"),
			Callback::follow(move |_| {
				f.fetch_add(1, Ordering::SeqCst);
				Ok(())
			}),
		)
		.await
		.unwrap();
		pool.add_callback(
			&account(name),
			&channel("shroud"),
			Callback::channel_point(move |_| {
				r.fetch_add(1, Ordering::SeqCst);
				anyhow::bail!("one failing subscriber does not stop the other")
			}),
		)
		.await
		.unwrap();
	}

	assert!(pool.dispatch_follow(&FollowEvent {
		channel_id: "id-shroud".into(),
		user_id: "1".into(),
		username: "newfan".into(),
		display_name: "NewFan".into(),
	}));
	assert_eq!(follows.load(Ordering::SeqCst), 1);

	let delivered = pool.dispatch_redemption(&RedemptionEvent {
		channel_id: "id-shroud".into(),
		redemption_id: "r1".into(),
		reward_id: "w1".into(),
		reward_title: "Airhorn".into(),
		user_login: "viewer".into(),
		user_display: "Viewer".into(),
		user_input: None,
	});
	assert_eq!(delivered, 2);
	assert_eq!(redemptions.load(Ordering::SeqCst), 2);

	assert!(!pool.dispatch_follow(&FollowEvent {
		channel_id: "id-elsewhere".into(),
		user_id: "1".into(),
		username: "x".into(),
		display_name: "x".into(),
	}));
}

#[tokio::test]
async fn supervisor_pass_is_not_blocked_by_a_hung_entry() {
	let factory = Arc::new(FakeFactory::default());
	factory.hang_reconnect_on.lock().insert("stuck".to_string());
	let pool = pool_with(factory.clone(), Arc::new(FakeResolver::default()));
	let hits = Arc::new(AtomicUsize::new(0));

	pool.add_callback(&account("cathy"), &channel("stuck"), counting_message(&hits))
		.await
		.unwrap();
	pool.add_callback(&account("cathy"), &channel("healthy"), counting_message(&hits))
		.await
		.unwrap();

	let (stuck, healthy) = (factory.transport(0), factory.transport(1));
	assert!(eventually(|| healthy.connects.load(Ordering::SeqCst) == 1 && stuck.connects.load(Ordering::SeqCst) == 1).await);
	stuck.set_state(false, false);
	healthy.set_state(false, false);

	let cfg = SupervisorConfig {
		interval: Duration::from_millis(10),
		signal_wait: Duration::from_millis(20),
		step_timeout: Duration::from_millis(40),
	};
	timeout(Duration::from_secs(1), supervisor::run_pass(&pool, &cfg))
		.await
		.expect("pass must finish despite the hung reconnect");

	assert_eq!(stuck.reconnects.load(Ordering::SeqCst), 1);
	assert_eq!(healthy.reconnects.load(Ordering::SeqCst), 1);
	assert!(pool.is_connected(&account("cathy"), &channel("healthy")));
	assert!(!pool.is_connected(&account("cathy"), &channel("stuck")));
}

#[tokio::test]
async fn supervisor_rejoins_a_connected_but_empty_transport() {
	let (pool, factory, _) = pool();
	let hits = Arc::new(AtomicUsize::new(0));
	let (acct, chan) = (account("cathy"), channel("shroud"));
	pool.add_callback(&acct, &chan, counting_message(&hits)).await.unwrap();

	let transport = factory.transport(0);
	assert!(eventually(|| pool.is_connected(&acct, &chan)).await);
	transport.set_state(true, false);

	let supervisor = Supervisor::start(
		&pool,
		SupervisorConfig {
			interval: Duration::from_millis(5),
			signal_wait: Duration::from_millis(50),
			step_timeout: Duration::from_millis(100),
		},
	);
	assert!(eventually(|| pool.is_connected(&acct, &chan)).await);
	assert!(transport.joins.load(Ordering::SeqCst) >= 1);
	assert_eq!(transport.reconnects.load(Ordering::SeqCst), 0);
	supervisor.shutdown().await;
}

#[tokio::test]
async fn chatters_are_collected_across_chats() {
	let (pool, _, resolver) = pool();
	resolver
		.chatters
		.lock()
		.insert("id-shroud".into(), vec!["a".into(), "b".into()]);
	let hits = Arc::new(AtomicUsize::new(0));
	pool.add_callback(&account("cathy"), &channel("shroud"), counting_message(&hits))
		.await
		.unwrap();
	pool.add_callback(&account("cathy"), &channel("unlisted"), counting_message(&hits))
		.await
		.unwrap();

	let mut users = pool.users_from_all_chats().await;
	users.sort_by(|a, b| a.username.cmp(&b.username));
	assert_eq!(
		users,
		vec![
			Chatter {
				channel: channel("shroud"),
				username: "a".into()
			},
			Chatter {
				channel: channel("shroud"),
				username: "b".into()
			},
		]
	);
}

#[tokio::test]
async fn shutdown_disconnects_everything() {
	let (pool, factory, _) = pool();
	let hits = Arc::new(AtomicUsize::new(0));
	pool.add_callback(&account("cathy"), &channel("shroud"), counting_message(&hits))
		.await
		.unwrap();
	pool.shutdown().await;
	assert!(pool.is_empty());
	assert_eq!(factory.transport(0).disconnects.load(Ordering::SeqCst), 1);
}
