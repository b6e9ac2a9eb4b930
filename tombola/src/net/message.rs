use crate::bets::Bet;
use crate::net::shared::{ErrorType, NetworkError, NetworkResult, SizedRead};
use crate::net::transport::Transport;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use chrono::DateTime;
use std::io;
use std::io::{Cursor, Write};

pub const MSG_REGISTER_BETS: u16 = 1;
pub const MSG_REGISTER_BETS_OK: u16 = 2;
pub const MSG_REGISTER_BETS_FAILED: u16 = 3;
pub const MSG_ACK: u16 = 4;
pub const MSG_ALL_BETS_SENT: u16 = 5;
pub const MSG_REQUEST_WINNERS: u16 = 6;
pub const MSG_INFORM_WINNERS: u16 = 7;

pub const FAILURE_UNKNOWN_MESSAGE: u16 = 1;
pub const FAILURE_COULD_NOT_PROCESS_BET: u16 = 2;

// Upper bounds on client controlled counts. Anything larger is rejected before
// allocation so a corrupt length prefix cannot pin the session.
pub const MAX_BATCH_BETS: u32 = 8192;
pub const MAX_BET_SIZE: u32 = 4096;
pub const MAX_WINNERS: u32 = 65536;

const BET_FIXED_SIZE: usize = 28;

/// Protocol level bet as it travels inside a `RegisterBets` batch. Names are
/// length-prefixed UTF-8, the birthdate is signed Unix seconds.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct WireBet {
    pub agency: u32,
    pub name: String,
    pub surname: String,
    pub dni: u32,
    pub birthdate: i64,
    pub number: u32,
}

impl WireBet {
    /// Parse one bet body. The caller hands over exactly the declared body and
    /// verifies afterwards that nothing was left unread.
    pub fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<WireBet> {
        let agency = take_u32(stream)?;
        let name = take_string(stream)?;
        let surname = take_string(stream)?;
        let dni = take_u32(stream)?;
        let birthdate = take_i64(stream)?;
        let number = take_u32(stream)?;

        Ok(WireBet {
            agency,
            name,
            surname,
            dni,
            birthdate,
            number,
        })
    }

    pub fn serialize<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u32::<BigEndian>(self.agency)?;
        stream.write_u32::<BigEndian>(self.name.len() as u32)?;
        stream.write_all(self.name.as_bytes())?;
        stream.write_u32::<BigEndian>(self.surname.len() as u32)?;
        stream.write_all(self.surname.as_bytes())?;
        stream.write_u32::<BigEndian>(self.dni)?;
        stream.write_i64::<BigEndian>(self.birthdate)?;
        stream.write_u32::<BigEndian>(self.number)
    }

    /// Size of the encoded body, used for the per-bet length prefix.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        BET_FIXED_SIZE + self.name.len() + self.surname.len()
    }

    /// Resolve into the domain record. `None` when the timestamp does not map
    /// onto a representable calendar date.
    pub fn into_bet(self) -> Option<Bet> {
        let birthdate = DateTime::from_timestamp(self.birthdate, 0)?.date_naive();

        Some(Bet {
            agency: self.agency,
            first_name: self.name,
            last_name: self.surname,
            document: self.dni,
            birthdate,
            number: self.number,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Message {
    RegisterBets(Vec<WireBet>),
    RegisterBetsOk,
    RegisterBetsFailed(u16),
    Ack,
    AllBetsSent,
    RequestWinners,
    InformWinners(Vec<u32>),
}

impl Message {
    /// The wire discriminator of this message kind.
    #[inline]
    pub fn kind(&self) -> u16 {
        match self {
            Message::RegisterBets(_) => MSG_REGISTER_BETS,
            Message::RegisterBetsOk => MSG_REGISTER_BETS_OK,
            Message::RegisterBetsFailed(_) => MSG_REGISTER_BETS_FAILED,
            Message::Ack => MSG_ACK,
            Message::AllBetsSent => MSG_ALL_BETS_SENT,
            Message::RequestWinners => MSG_REQUEST_WINNERS,
            Message::InformWinners(_) => MSG_INFORM_WINNERS,
        }
    }

    /// Read one message off the transport. Each kind reads only its declared
    /// payload, so the next read starts at a message boundary.
    pub fn read<T: Transport>(transport: &mut T) -> NetworkResult<Message> {
        let msg_type = read_u16(transport)?;

        match msg_type {
            MSG_REGISTER_BETS => Self::read_register_bets(transport),
            MSG_REGISTER_BETS_OK => Ok(Message::RegisterBetsOk),
            MSG_REGISTER_BETS_FAILED => Self::read_register_bets_failed(transport),
            MSG_ACK => Ok(Message::Ack),
            MSG_ALL_BETS_SENT => Ok(Message::AllBetsSent),
            MSG_REQUEST_WINNERS => Ok(Message::RequestWinners),
            MSG_INFORM_WINNERS => Self::read_inform_winners(transport),
            unknown => Err(NetworkError::Fatal(ErrorType::UnknownMessage(unknown))),
        }
    }

    fn read_register_bets<T: Transport>(transport: &mut T) -> NetworkResult<Message> {
        let count = read_u32(transport)?;

        if count > MAX_BATCH_BETS {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        let mut bets = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let length = read_u32(transport)?;

            if length > MAX_BET_SIZE {
                return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
            }

            let payload = transport.recv_exact(length as usize)?;
            let mut stream = Cursor::new(&payload[..]);
            let bet = WireBet::deserialize(&mut stream)?;

            if stream.remaining_data() != 0 {
                return Err(NetworkError::Fatal(ErrorType::Malformed));
            }

            bets.push(bet);
        }

        Ok(Message::RegisterBets(bets))
    }

    fn read_register_bets_failed<T: Transport>(transport: &mut T) -> NetworkResult<Message> {
        let length = read_u32(transport)?;

        if length != 2 {
            return Err(NetworkError::Fatal(ErrorType::Malformed));
        }

        Ok(Message::RegisterBetsFailed(read_u16(transport)?))
    }

    fn read_inform_winners<T: Transport>(transport: &mut T) -> NetworkResult<Message> {
        let count = read_u32(transport)?;

        if count > MAX_WINNERS {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        let payload = transport.recv_exact(count as usize * 4)?;
        let mut stream = Cursor::new(&payload[..]);
        let mut winners = Vec::with_capacity(count as usize);

        for _ in 0..count {
            winners.push(stream.read_u32::<BigEndian>()?);
        }

        Ok(Message::InformWinners(winners))
    }

    /// Encode the message. Inverse of `read` for every well-formed message.
    pub fn write<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        stream.write_u16::<BigEndian>(self.kind())?;

        match self {
            Message::RegisterBets(bets) => {
                stream.write_u32::<BigEndian>(bets.len() as u32)?;
                for bet in bets {
                    stream.write_u32::<BigEndian>(bet.encoded_len() as u32)?;
                    bet.serialize(stream)?;
                }
                Ok(())
            }
            Message::RegisterBetsFailed(error_code) => {
                stream.write_u32::<BigEndian>(2)?;
                stream.write_u16::<BigEndian>(*error_code)
            }
            Message::InformWinners(winners) => {
                stream.write_u32::<BigEndian>(winners.len() as u32)?;
                for document in winners {
                    stream.write_u32::<BigEndian>(*document)?;
                }
                Ok(())
            }
            Message::RegisterBetsOk
            | Message::Ack
            | Message::AllBetsSent
            | Message::RequestWinners => Ok(()),
        }
    }
}

fn read_u16<T: Transport>(transport: &mut T) -> NetworkResult<u16> {
    let data = transport.recv_exact(2)?;
    Ok((&data[..]).read_u16::<BigEndian>()?)
}

fn read_u32<T: Transport>(transport: &mut T) -> NetworkResult<u32> {
    let data = transport.recv_exact(4)?;
    Ok((&data[..]).read_u32::<BigEndian>()?)
}

fn take_u32<R: SizedRead>(stream: &mut R) -> NetworkResult<u32> {
    if stream.remaining_data() < 4 {
        return Err(NetworkError::Fatal(ErrorType::Malformed));
    }

    Ok(stream.read_u32::<BigEndian>()?)
}

fn take_i64<R: SizedRead>(stream: &mut R) -> NetworkResult<i64> {
    if stream.remaining_data() < 8 {
        return Err(NetworkError::Fatal(ErrorType::Malformed));
    }

    Ok(stream.read_i64::<BigEndian>()?)
}

fn take_string<R: SizedRead>(stream: &mut R) -> NetworkResult<String> {
    let length = take_u32(stream)? as usize;

    if stream.remaining_data() < length {
        return Err(NetworkError::Fatal(ErrorType::Malformed));
    }

    let mut raw = vec![0u8; length];
    stream.read_exact(&mut raw)?;

    String::from_utf8(raw).map_err(|_| NetworkError::Fatal(ErrorType::Encoding))
}
