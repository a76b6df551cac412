use anyhow::{bail, Result};
use clap::Subcommand;
use tracing::warn;

use crate::social::groups::{rank_members, LeaderboardEntry};
use crate::utils::clock::Clock;

use super::report::format_minutes;
use super::{open_session, Services};

#[derive(Subcommand, Debug)]
pub enum FriendsCommand {
    #[command(about = "List friends and pending requests")]
    List {},
    #[command(about = "Show your friend code")]
    Code {},
    #[command(about = "Send a friend request to the owner of a code")]
    Request { code: String },
    #[command(about = "Accept a request somebody sent you")]
    Accept { from_uid: String },
    #[command(about = "Withdraw a request you sent")]
    Cancel { to_uid: String },
    #[command(about = "Remove a friend from your list")]
    Remove { uid: String },
}

#[derive(Subcommand, Debug)]
pub enum GroupsCommand {
    #[command(about = "List your groups")]
    List {},
    #[command(about = "Create a group with you as the owner")]
    Create {
        name: String,
        #[arg(long, help = "App the group watches")]
        app: Option<String>,
        #[arg(long, default_value_t = 0, help = "Daily goal minutes for the watched app")]
        goal: u32,
    },
    #[command(about = "Invite a friend into a group")]
    Add {
        group_id: String,
        friend_uid: String,
    },
    #[command(about = "Leave a group. The last member out deletes it")]
    Leave { group_id: String },
    #[command(about = "Delete a group you own")]
    Delete { group_id: String },
    #[command(about = "Point a group at an app and daily limit")]
    Goal {
        group_id: String,
        minutes: u32,
        #[arg(long, help = "App the goal applies to. Keeps the current one when omitted")]
        app: Option<String>,
    },
    #[command(about = "Show the ranked member usage of a group")]
    Leaderboard {
        #[arg(help = "Defaults to your first group")]
        group_id: Option<String>,
        #[arg(long, help = "Keep printing as new snapshots arrive")]
        follow: bool,
    },
}

pub async fn process_friends_command(services: &Services, command: FriendsCommand) -> Result<()> {
    let session = open_session(services).await?;
    let friends = session.friends();
    match command {
        FriendsCommand::List {} => {
            if let Err(e) = friends.load_friends().await {
                warn!("Friend refresh failed: {e:#}");
            }
            if let Err(e) = friends.load_requests().await {
                warn!("Request refresh failed: {e:#}");
            }

            let list = friends.friends().await?;
            if list.is_empty() {
                println!("No friends yet. Share your code from `pixeldiet friends code`.");
            }
            for friend in list {
                println!("{}\t{}", friend.uid, friend.name);
            }

            let received = friends.requests_received().await?;
            if !received.is_empty() {
                println!();
                println!("Requests received:");
                for request in received {
                    println!("{}\t{}", request.from_uid, request.from_name);
                }
            }
            let sent = friends.requests_sent().await?;
            if !sent.is_empty() {
                println!();
                println!("Requests sent:");
                for request in sent {
                    println!("{}\t{}", request.to_uid, request.to_name);
                }
            }
            Ok(())
        }
        FriendsCommand::Code {} => {
            match session.profile().await? {
                Some(profile) => println!("{}", profile.friend_code),
                None => println!("No profile yet. Run `pixeldiet sync` first."),
            }
            Ok(())
        }
        FriendsCommand::Request { code } => {
            friends.send_request(&code).await?;
            println!("Request sent");
            Ok(())
        }
        FriendsCommand::Accept { from_uid } => {
            friends.load_requests().await?;
            let requests = friends.requests_received().await?;
            let Some(request) = requests
                .iter()
                .find(|request| &*request.from_uid == from_uid.as_str())
            else {
                bail!("No pending request from {from_uid}");
            };
            friends.accept_request(request).await?;
            println!("Accepted {}", request.from_name);
            Ok(())
        }
        FriendsCommand::Cancel { to_uid } => {
            friends.load_requests().await?;
            let requests = friends.requests_sent().await?;
            let Some(request) = requests
                .iter()
                .find(|request| &*request.to_uid == to_uid.as_str())
            else {
                bail!("No pending request to {to_uid}");
            };
            friends.cancel_request(request).await?;
            println!("Cancelled the request to {}", request.to_name);
            Ok(())
        }
        FriendsCommand::Remove { uid } => {
            friends.remove_friend(&uid).await?;
            println!("Removed {uid}");
            Ok(())
        }
    }
}

pub async fn process_groups_command(services: &Services, command: GroupsCommand) -> Result<()> {
    let session = open_session(services).await?;
    let groups = session.groups();
    match command {
        GroupsCommand::List {} => {
            let listed = groups.groups().await?;
            if listed.is_empty() {
                println!("No groups. Create one with `pixeldiet groups create`.");
                return Ok(());
            }
            for group in listed {
                println!(
                    "{}\t{}\t{}\t{}\t{} members",
                    group.group_id,
                    group.name,
                    group.app_id.as_deref().unwrap_or("-"),
                    format_minutes(group.goal_minutes),
                    group.member_ids.len(),
                );
            }
            Ok(())
        }
        GroupsCommand::Create { name, app, goal } => {
            let group = groups
                .create_group(&name, app.map(Into::into), goal)
                .await?;
            println!("Created {} ({})", group.name, group.group_id);
            Ok(())
        }
        GroupsCommand::Add {
            group_id,
            friend_uid,
        } => {
            let list = session.friends().friends().await?;
            let Some(friend) = list
                .into_iter()
                .find(|friend| &*friend.uid == friend_uid.as_str())
            else {
                bail!("{friend_uid} is not in your friend list");
            };
            let name = friend.name.clone();
            groups.add_members(&group_id, &[friend]).await?;
            println!("Added {name} to {group_id}");
            Ok(())
        }
        GroupsCommand::Leave { group_id } => {
            groups.leave_group(&group_id).await?;
            println!("Left {group_id}");
            Ok(())
        }
        GroupsCommand::Delete { group_id } => {
            groups.delete_group(&group_id).await?;
            println!("Deleted {group_id}");
            Ok(())
        }
        GroupsCommand::Goal {
            group_id,
            minutes,
            app,
        } => {
            let app_id = match app {
                Some(app) => Some(app.into()),
                None => groups
                    .groups()
                    .await?
                    .into_iter()
                    .find(|group| &*group.group_id == group_id.as_str())
                    .and_then(|group| group.app_id),
            };
            groups.set_goal_minutes(&group_id, app_id, minutes).await?;
            println!("Goal set to {}", format_minutes(minutes));
            Ok(())
        }
        GroupsCommand::Leaderboard { group_id, follow } => {
            let group_id = match group_id {
                Some(id) => id,
                None => {
                    let listed = groups.groups().await?;
                    let Some(first) = listed.first() else {
                        bail!("You are not in any group");
                    };
                    first.group_id.to_string()
                }
            };

            if !follow {
                let members = groups.members(&group_id).await?;
                print_leaderboard(&rank_members(members, services.clock.time()));
                return Ok(());
            }

            let mut feed = groups.leaderboard(&group_id).await?;
            while let Some(entries) = feed.next().await {
                print_leaderboard(&entries);
                println!();
            }
            Ok(())
        }
    }
}

fn print_leaderboard(entries: &[LeaderboardEntry]) {
    for (place, entry) in entries.iter().enumerate() {
        let name = if entry.member.is_running {
            format!("{} (running)", entry.member.name)
        } else {
            entry.member.name.to_string()
        };
        println!(
            "{}\t{}\t{}",
            place + 1,
            format_duration(chrono::Duration::seconds(entry.effective_seconds as i64)),
            name,
        );
    }
}

fn format_duration(v: chrono::Duration) -> String {
    if v.num_hours() > 0 {
        format!(
            "{}h{}m{}s",
            v.num_hours(),
            v.num_minutes() % 60,
            v.num_seconds() % 60
        )
    } else if v.num_minutes() > 0 {
        format!("{}m{}s", v.num_minutes() % 60, v.num_seconds() % 60)
    } else {
        format!("{}s", v.num_seconds() % 60)
    }
}
