//! MAVLink helpers for routing and for the log sink.
//!
//! Routing only cares about the system a message is addressed to; the log
//! sink additionally needs to build the few control messages it sends to the
//! flight stack.

use mavlink::common::{
    MavCmd, MavMessage, COMMAND_LONG_DATA, LOGGING_ACK_DATA,
};
use mavlink::MavHeader;

/// Component id meaning "every component of the system".
pub const MAV_COMP_ID_ALL: u8 = 0;

/// The system and component a MAVLink message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageTarget {
    /// The target system ID (0 for broadcast).
    pub system_id: u8,
    /// The target component ID (0 for system-wide or broadcast).
    pub component_id: u8,
}

impl MessageTarget {
    /// A message with target system 0 goes to everybody.
    pub fn is_broadcast(&self) -> bool {
        self.system_id == 0
    }
}

/// Extracts the addressed system/component from a MAVLink message.
///
/// Messages without target fields, and responses that are implicitly
/// addressed to whoever asked (`COMMAND_ACK`, `PARAM_VALUE`, ...), are
/// reported as broadcast.
pub fn extract_target(msg: &MavMessage) -> MessageTarget {
    use MavMessage::*;

    let (system_id, component_id) = match msg {
        COMMAND_INT(m) => (m.target_system, m.target_component),
        COMMAND_LONG(m) => (m.target_system, m.target_component),
        COMMAND_CANCEL(m) => (m.target_system, m.target_component),

        MISSION_REQUEST_LIST(m) => (m.target_system, m.target_component),
        MISSION_REQUEST_PARTIAL_LIST(m) => (m.target_system, m.target_component),
        MISSION_WRITE_PARTIAL_LIST(m) => (m.target_system, m.target_component),
        MISSION_COUNT(m) => (m.target_system, m.target_component),
        MISSION_REQUEST(m) => (m.target_system, m.target_component),
        MISSION_REQUEST_INT(m) => (m.target_system, m.target_component),
        MISSION_ITEM(m) => (m.target_system, m.target_component),
        MISSION_ITEM_INT(m) => (m.target_system, m.target_component),
        MISSION_ACK(m) => (m.target_system, m.target_component),
        MISSION_CLEAR_ALL(m) => (m.target_system, m.target_component),
        MISSION_SET_CURRENT(m) => (m.target_system, m.target_component),

        PARAM_REQUEST_READ(m) => (m.target_system, m.target_component),
        PARAM_REQUEST_LIST(m) => (m.target_system, m.target_component),
        PARAM_SET(m) => (m.target_system, m.target_component),
        PARAM_EXT_SET(m) => (m.target_system, m.target_component),
        PARAM_EXT_REQUEST_READ(m) => (m.target_system, m.target_component),
        PARAM_EXT_REQUEST_LIST(m) => (m.target_system, m.target_component),

        SET_MODE(m) => (m.target_system, MAV_COMP_ID_ALL),
        SET_POSITION_TARGET_LOCAL_NED(m) => (m.target_system, m.target_component),
        SET_POSITION_TARGET_GLOBAL_INT(m) => (m.target_system, m.target_component),
        SET_ATTITUDE_TARGET(m) => (m.target_system, m.target_component),
        SET_GPS_GLOBAL_ORIGIN(m) => (m.target_system, MAV_COMP_ID_ALL),
        REQUEST_DATA_STREAM(m) => (m.target_system, m.target_component),
        RC_CHANNELS_OVERRIDE(m) => (m.target_system, m.target_component),
        GPS_INJECT_DATA(m) => (m.target_system, m.target_component),
        PING(m) => (m.target_system, m.target_component),
        CHANGE_OPERATOR_CONTROL(m) => (m.target_system, MAV_COMP_ID_ALL),
        CHANGE_OPERATOR_CONTROL_ACK(m) => (m.gcs_system_id, MAV_COMP_ID_ALL),

        LOG_REQUEST_LIST(m) => (m.target_system, m.target_component),
        LOG_REQUEST_DATA(m) => (m.target_system, m.target_component),
        LOG_ERASE(m) => (m.target_system, m.target_component),
        LOG_REQUEST_END(m) => (m.target_system, m.target_component),
        LOGGING_DATA(m) => (m.target_system, m.target_component),
        LOGGING_DATA_ACKED(m) => (m.target_system, m.target_component),
        LOGGING_ACK(m) => (m.target_system, m.target_component),

        FILE_TRANSFER_PROTOCOL(m) => (m.target_system, m.target_component),
        SETUP_SIGNING(m) => (m.target_system, m.target_component),
        TUNNEL(m) => (m.target_system, m.target_component),

        _ => (0, 0),
    };

    MessageTarget {
        system_id,
        component_id,
    }
}

/// Header used for frames the router itself originates.
pub fn local_header(system_id: u8, sequence: u8) -> MavHeader {
    MavHeader {
        system_id,
        component_id: MAV_COMP_ID_ALL,
        sequence,
    }
}

/// `COMMAND_LONG` carrying a parameterless command (logging start/stop).
pub fn command_long(command: MavCmd, target_system: u8) -> MavMessage {
    MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
        target_system,
        target_component: MAV_COMP_ID_ALL,
        command,
        confirmation: 0,
        param1: 0.0,
        param2: 0.0,
        param3: 0.0,
        param4: 0.0,
        param5: 0.0,
        param6: 0.0,
        param7: 0.0,
    })
}

/// Acknowledges one acked log chunk.
pub fn logging_ack(sequence: u16, target_system: u8) -> MavMessage {
    MavMessage::LOGGING_ACK(LOGGING_ACK_DATA {
        sequence,
        target_system,
        target_component: MAV_COMP_ID_ALL,
    })
}
